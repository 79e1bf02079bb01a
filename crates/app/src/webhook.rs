use std::{sync::Arc, time::Instant};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use storypulse_core::normalizer::Normalizer;
use storypulse_core::signature::{verify_signature, SignatureError, SIGNATURE_HEADER};
use storypulse_storage::{MentionStoreError, Organization, OrganizationError};

use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Subscription handshake: echo the challenge when the verify token matches.
pub async fn verify_subscription(
    State(state): State<AppState>,
    Query(query): Query<HubQuery>,
) -> Result<Response, ProblemResponse> {
    let expected = state.webhook_verify_token().unwrap_or_default();
    let provided = query.verify_token.as_deref().unwrap_or_default();
    let token_matches =
        !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()));

    match (query.mode.as_deref(), query.challenge) {
        (Some("subscribe"), Some(challenge)) if token_matches => {
            info!(stage = "ingress", "webhook subscription verified");
            Ok((StatusCode::OK, challenge).into_response())
        }
        _ => {
            warn!(stage = "ingress", "webhook subscription handshake rejected");
            Err(ProblemResponse::new(
                StatusCode::FORBIDDEN,
                "verify_token_mismatch",
                "subscription verification failed",
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    #[serde(default)]
    organization: Option<String>,
}

pub async fn handle(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = ingest(&state, query, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    result
}

async fn ingest(
    state: &AppState,
    query: TenantQuery,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    // Parsed only to route the request; the signature always covers the raw bytes.
    let parsed: Option<Value> = serde_json::from_slice(body).ok();

    let organization = resolve_tenant(state, query.organization.as_deref(), parsed.as_ref())
        .await
        .map_err(|err| ProblemResponse::internal("ingress", err))?;

    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let organization = match organization {
        Some(org) => {
            let secret = tenant_secret(state, &org);
            if let Err(err) = verify_signature(body, header, secret.as_deref()) {
                return Err(reject(Some(&org.id), err, body.len()));
            }
            org
        }
        None => {
            return Err(reject(
                None,
                SignatureError::SecretNotConfigured,
                body.len(),
            ))
        }
    };

    let Some(payload) = parsed else {
        counter!("webhook_ingress_total", "result" => "ignored").increment(1);
        info!(stage = "ingress", organization_id = %organization.id, "payload is not JSON; ignored");
        return Ok(ack("ignored", 0, 0, 0, 0));
    };

    let now = state.now();
    let batch = match Normalizer::normalize(&payload, now) {
        Ok(batch) => batch,
        Err(err) => {
            counter!("webhook_ingress_total", "result" => "ignored").increment(1);
            info!(
                stage = "normalizer",
                organization_id = %organization.id,
                error = %err,
                "payload shape not handled; ignored"
            );
            return Ok(ack("ignored", 0, 0, 0, 0));
        }
    };

    for dropped in &batch.dropped {
        counter!("normalizer_dropped_total", "reason" => dropped.reason.as_str()).increment(1);
        warn!(
            stage = "normalizer",
            organization_id = %organization.id,
            entry_index = dropped.entry_index,
            messaging_index = ?dropped.messaging_index,
            reason = dropped.reason.as_str(),
            "messaging item dropped"
        );
    }

    let mentions = state.storage().mentions();
    let mut created = 0usize;
    let mut duplicates = 0usize;
    for event in &batch.events {
        match mentions.insert_if_absent(&organization.id, event, now).await {
            Ok((mention, true)) => {
                created += 1;
                counter!("mentions_ingested_total", "result" => "created").increment(1);
                info!(
                    stage = "store",
                    organization_id = %organization.id,
                    mention_id = %mention.id,
                    story_id = %mention.instagram_story_id,
                    matched_ambassador = mention.matched_ambassador_id.is_some(),
                    "mention recorded"
                );
            }
            Ok((_, false)) => {
                duplicates += 1;
                counter!("mentions_ingested_total", "result" => "duplicate").increment(1);
            }
            Err(err) => {
                counter!("webhook_ingress_total", "result" => "error").increment(1);
                error!(
                    stage = "store",
                    organization_id = %organization.id,
                    story_id = %event.external_id,
                    error = %err,
                    "failed to record mention"
                );
                return Err(store_problem(err));
            }
        }
    }

    counter!("webhook_ingress_total", "result" => "accepted").increment(1);
    Ok(ack(
        "accepted",
        created,
        duplicates,
        batch.dropped.len(),
        batch.ignored,
    ))
}

async fn resolve_tenant(
    state: &AppState,
    organization_id: Option<&str>,
    payload: Option<&Value>,
) -> Result<Option<Organization>, OrganizationError> {
    let organizations = state.storage().organizations();
    if let Some(id) = organization_id {
        return organizations.fetch(id).await;
    }
    match payload.and_then(Normalizer::recipient_account_id) {
        Some(account_id) => organizations.find_by_instagram_user(account_id).await,
        None => Ok(None),
    }
}

pub(crate) fn tenant_secret(state: &AppState, organization: &Organization) -> Option<Arc<[u8]>> {
    organization
        .webhook_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .map(|secret| Arc::from(secret.as_bytes()))
        .or_else(|| state.webhook_app_secret())
}

fn reject(organization_id: Option<&str>, err: SignatureError, body_len: usize) -> ProblemResponse {
    let reason = if organization_id.is_some() {
        err.reason()
    } else {
        "unknown_tenant"
    };
    counter!("webhook_invalid_signature_total", "reason" => reason).increment(1);
    counter!("webhook_ingress_total", "result" => "rejected").increment(1);
    warn!(
        stage = "ingress",
        organization_id = organization_id.unwrap_or("unknown"),
        reason,
        body_len,
        "webhook rejected: signature verification failed"
    );
    ProblemResponse::new(
        StatusCode::UNAUTHORIZED,
        err.code(),
        "webhook signature could not be verified",
    )
}

fn ack(status: &str, created: usize, duplicates: usize, dropped: usize, ignored: usize) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "created": created,
            "duplicates": duplicates,
            "dropped": dropped,
            "ignored": ignored,
        })),
    )
        .into_response()
}

fn store_problem(err: MentionStoreError) -> ProblemResponse {
    match err {
        MentionStoreError::MissingOrganization => ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "organization_not_found",
            "organization no longer exists",
        ),
        other => ProblemResponse::internal("store", other),
    }
}
