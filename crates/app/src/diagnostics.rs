use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use storypulse_core::signature::{sign_payload, SIGNATURE_HEADER};
use storypulse_instagram::GraphError;
use storypulse_storage::{InstagramToken, Organization};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub organization_id: String,
    pub checks: Vec<CheckResult>,
}

/// Runs every self-test for the caller's organization. Checks are independent; one
/// failing never hides the others.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DiagnosticsReport>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let organization = state
        .storage()
        .organizations()
        .fetch(&caller.organization_id)
        .await
        .map_err(|err| ProblemResponse::internal("diagnostics", err))?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "organization_not_found",
                "organization not found",
            )
        })?;
    let token = state
        .storage()
        .tokens()
        .fetch(&organization.id)
        .await
        .map_err(|err| ProblemResponse::internal("diagnostics", err))?;

    let mut checks = match &token {
        Some(token) => graph_checks(&state, token).await,
        None => ["token_validity", "profile", "mentions_permission", "stories_permission"]
            .into_iter()
            .map(|name| CheckResult::new(name, CheckStatus::Fail, "instagram is not connected"))
            .collect(),
    };
    checks.push(webhook_roundtrip(&state, &organization).await);

    let failed = checks
        .iter()
        .filter(|check| check.status == CheckStatus::Fail)
        .count();
    info!(
        stage = "diagnostics",
        organization_id = %organization.id,
        checks = checks.len(),
        failed,
        "diagnostics completed"
    );
    Ok(Json(DiagnosticsReport {
        organization_id: organization.id,
        checks,
    }))
}

async fn graph_checks(state: &AppState, token: &InstagramToken) -> Vec<CheckResult> {
    let graph = state.graph();
    let access_token = token.access_token.as_str();
    let user_id = token.instagram_user_id.as_str();
    let mut checks = Vec::with_capacity(4);

    checks.push(match graph.me(access_token).await {
        Ok(user) => CheckResult::new(
            "token_validity",
            CheckStatus::Pass,
            format!(
                "token accepted for {}",
                user.username.as_deref().unwrap_or(user_id)
            ),
        ),
        Err(err) => CheckResult::new("token_validity", CheckStatus::Fail, describe(&err)),
    });

    checks.push(match graph.profile(access_token, user_id).await {
        Ok(profile) => CheckResult::new(
            "profile",
            CheckStatus::Pass,
            format!("profile {} readable", profile.id),
        ),
        Err(err) => CheckResult::new("profile", CheckStatus::Fail, describe(&err)),
    });

    checks.push(match graph.probe_mentions(access_token, user_id).await {
        Ok(()) => CheckResult::new("mentions_permission", CheckStatus::Pass, "tagged media readable"),
        Err(err) => CheckResult::new("mentions_permission", CheckStatus::Fail, describe(&err)),
    });

    // Some account types never expose stories; report as a warning only.
    checks.push(match graph.probe_stories(access_token, user_id).await {
        Ok(()) => CheckResult::new("stories_permission", CheckStatus::Pass, "stories readable"),
        Err(err) => CheckResult::new("stories_permission", CheckStatus::Warn, describe(&err)),
    });

    checks
}

/// Signs a synthetic delivery with the tenant's secret and posts it to our own webhook.
async fn webhook_roundtrip(state: &AppState, organization: &Organization) -> CheckResult {
    const NAME: &str = "webhook_roundtrip";

    let Some(secret) = webhook::tenant_secret(state, organization) else {
        return CheckResult::new(NAME, CheckStatus::Fail, "no webhook secret configured");
    };
    let mut url = match state.public_base_url().join("webhook") {
        Ok(url) => url,
        Err(err) => return CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    };
    url.query_pairs_mut()
        .append_pair("organization", &organization.id);

    let entry_id = organization
        .instagram_user_id
        .as_deref()
        .unwrap_or(organization.id.as_str());
    let body = json!({
        "object": "instagram",
        "entry": [{
            "id": entry_id,
            "time": state.now().timestamp(),
            "messaging": [],
        }],
    })
    .to_string();
    let signature = sign_payload(body.as_bytes(), &secret);

    let result = state
        .http()
        .post(url)
        .header(SIGNATURE_HEADER, signature)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            CheckResult::new(NAME, CheckStatus::Pass, "signed delivery accepted")
        }
        Ok(response) => {
            warn!(
                stage = "diagnostics",
                organization_id = %organization.id,
                status = response.status().as_u16(),
                "webhook roundtrip rejected"
            );
            CheckResult::new(
                NAME,
                CheckStatus::Fail,
                format!("webhook answered {}", response.status()),
            )
        }
        Err(err) => CheckResult::new(
            NAME,
            CheckStatus::Fail,
            format!("webhook unreachable: {}", err.without_url()),
        ),
    }
}

fn describe(err: &GraphError) -> String {
    if err.is_invalid_token() {
        "token rejected by instagram".to_string()
    } else if err.is_permission_denied() {
        "permission not granted".to_string()
    } else {
        err.to_string()
    }
}
