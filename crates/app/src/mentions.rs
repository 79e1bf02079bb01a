use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use storypulse_core::lifecycle::{self, Decision};
use storypulse_core::types::MentionState;

use crate::auth::Trigger;
use crate::evaluator::{EvaluationReport, EvaluatorError};
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Records the author's early-delete report and flags the mention right away.
pub async fn report_deleted(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ProblemResponse> {
    let now = state.now();
    let caller = state.authenticator().caller(&headers, now)?;
    let repo = state.storage().mentions();

    let mention = repo
        .fetch(&id)
        .await
        .map_err(|err| ProblemResponse::internal("evaluator", err))?
        .filter(|mention| mention.organization_id == caller.organization_id)
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "mention_not_found",
                format!("mention {id} not found"),
            )
        })?;

    match mention.state {
        MentionState::New => {}
        MentionState::FlaggedEarlyDelete => {
            return Ok(Json(json!({ "mention": mention, "notified": false })));
        }
        other => {
            return Err(ProblemResponse::new(
                StatusCode::CONFLICT,
                "mention_already_resolved",
                format!("mention is already {other}"),
            ));
        }
    }

    let reported = repo
        .record_early_delete_report(&caller.organization_id, &id, now)
        .await
        .map_err(|err| ProblemResponse::internal("evaluator", err))?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "mention_not_found",
                format!("mention {id} not found"),
            )
        })?;
    info!(
        stage = "evaluator",
        mention_id = %id,
        organization_id = %caller.organization_id,
        user_id = %caller.user_id,
        "early delete reported"
    );

    // The flag is persisted first; if this write loses, the next evaluator pass applies it.
    let notified = match lifecycle::transition_for(Decision::FlagEarlyDelete) {
        Some(transition) => state
            .evaluator()
            .apply(&reported, transition, now)
            .await
            .map_err(evaluator_problem)?,
        None => false,
    };

    let current = repo
        .fetch(&id)
        .await
        .map_err(|err| ProblemResponse::internal("evaluator", err))?
        .unwrap_or(reported);
    Ok(Json(json!({ "mention": current, "notified": notified })))
}

#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    organization_id: Option<String>,
}

/// Manual or scheduled evaluator pass.
///
/// Cron callers may scope to any organization or none; user callers are pinned to their own.
pub async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EvaluationReport>, ProblemResponse> {
    let trigger = state.authenticator().trigger(&headers, state.now())?;
    let request: ResolveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_json", err.to_string())
        })?
    };

    let scope = match trigger {
        Trigger::Cron => request.organization_id,
        Trigger::User(caller) => {
            if let Some(requested) = request.organization_id.as_deref() {
                if requested != caller.organization_id {
                    return Err(ProblemResponse::new(
                        StatusCode::FORBIDDEN,
                        "organization_scope",
                        "callers may only resolve their own organization",
                    ));
                }
            }
            Some(caller.organization_id)
        }
    };

    let report = state
        .evaluator()
        .run_once(scope.as_deref())
        .await
        .map_err(evaluator_problem)?;
    Ok(Json(report))
}

fn evaluator_problem(err: EvaluatorError) -> ProblemResponse {
    ProblemResponse::internal("evaluator", err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use storypulse_core::types::{MentionEvent, MentionType, NotificationPriority, SocialMention};

    use crate::router::{app_router, test_support};

    async fn seed_mention(state: &AppState, organization_id: &str, story_id: &str) -> SocialMention {
        let mentioned_at = Utc::now() - Duration::hours(2);
        let event = MentionEvent {
            external_id: story_id.to_string(),
            sender_id: "fan-1".to_string(),
            sender_username: None,
            mention_type: MentionType::StoryReferral,
            content: None,
            mentioned_at,
            story_verifiable: true,
            raw: json!({}),
        };
        state
            .storage()
            .mentions()
            .insert_if_absent(organization_id, &event, mentioned_at)
            .await
            .expect("insert")
            .0
    }

    async fn post(state: AppState, uri: &str, bearer: &str, body: &str) -> (StatusCode, Value) {
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("Authorization", format!("Bearer {bearer}"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn report_flags_mention_and_notifies_once() {
        let state = test_support::setup_state().await;
        let mention = seed_mention(&state, "org-1", "story-early").await;
        let token = test_support::caller_token("owner-1", "org-1");
        let uri = format!("/mentions/{}/report-deleted", mention.id);

        let (status, body) = post(state.clone(), &uri, &token, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mention"]["state"], "flagged_early_delete");
        assert_eq!(body["notified"], true);

        let (status, body) = post(state.clone(), &uri, &token, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["notified"], false);

        let feed = state
            .storage()
            .notifications()
            .list("org-1", false, 10)
            .await
            .expect("feed");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, "mention_early_delete");
        assert_eq!(feed[0].priority, NotificationPriority::Normal);
        assert_eq!(feed[0].target_id.as_deref(), Some(mention.id.as_str()));
    }

    #[tokio::test]
    async fn report_survives_notification_outage_and_is_flagged_later() {
        let state = test_support::setup_state().await;
        let mention = seed_mention(&state, "org-1", "story-outage").await;
        let token = test_support::caller_token("owner-1", "org-1");
        sqlx::query(
            "CREATE TRIGGER reject_notifications BEFORE INSERT ON notifications \
             BEGIN SELECT RAISE(ABORT, 'notifications unavailable'); END",
        )
        .execute(state.storage().pool())
        .await
        .expect("trigger");

        let uri = format!("/mentions/{}/report-deleted", mention.id);
        let (status, _) = post(state.clone(), &uri, &token, "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let stored = state
            .storage()
            .mentions()
            .fetch(&mention.id)
            .await
            .expect("fetch")
            .expect("mention");
        assert_eq!(stored.state, MentionState::New);
        assert!(stored.is_reported_deleted());

        sqlx::query("DROP TRIGGER reject_notifications")
            .execute(state.storage().pool())
            .await
            .expect("drop trigger");

        let (status, report) =
            post(state.clone(), "/internal/mentions/resolve", test_support::CRON_SECRET, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["notifications_sent"], 1);
        let feed = state
            .storage()
            .notifications()
            .list("org-1", false, 10)
            .await
            .expect("feed");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, "mention_early_delete");
    }

    #[tokio::test]
    async fn report_is_scoped_and_refuses_resolved_mentions() {
        let state = test_support::setup_state().await;
        test_support::seed_organization(state.storage(), "org-2", "owner-2", None).await;
        let foreign = seed_mention(&state, "org-2", "story-foreign").await;
        let token = test_support::caller_token("owner-1", "org-1");

        let (status, body) = post(
            state.clone(),
            &format!("/mentions/{}/report-deleted", foreign.id),
            &token,
            "",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "mention_not_found");

        let completed = seed_mention(&state, "org-1", "story-done").await;
        state
            .storage()
            .mentions()
            .conditional_transition(
                &completed.id,
                MentionState::New,
                MentionState::Completed,
                true,
                Utc::now(),
            )
            .await
            .expect("complete");
        let (status, body) = post(
            state.clone(),
            &format!("/mentions/{}/report-deleted", completed.id),
            &token,
            "",
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "mention_already_resolved");
    }

    #[tokio::test]
    async fn resolve_accepts_cron_secret_and_scopes_users() {
        let state = test_support::setup_state().await;
        test_support::seed_organization(state.storage(), "org-2", "owner-2", None).await;
        seed_mention(&state, "org-1", "story-a").await;
        seed_mention(&state, "org-2", "story-b").await;

        let (status, report) =
            post(state.clone(), "/internal/mentions/resolve", test_support::CRON_SECRET, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["processed"], 2);
        assert_eq!(report["notifications_sent"], 0);

        let token = test_support::caller_token("owner-1", "org-1");
        let (status, report) = post(state.clone(), "/internal/mentions/resolve", &token, "{}").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["processed"], 1);

        let (status, _) = post(
            state.clone(),
            "/internal/mentions/resolve",
            &token,
            r#"{"organization_id":"org-2"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = post(state, "/internal/mentions/resolve", "wrong", "").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
