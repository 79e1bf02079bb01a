use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info};

use storypulse_core::types::{NewNotification, Notification};
use storypulse_storage::{Database, NotificationStoreError};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const DEFAULT_FEED_LIMIT: u32 = 50;
const MAX_FEED_LIMIT: u32 = 200;

/// Persists notifications produced by the evaluator and the token manager.
#[derive(Clone)]
pub struct Notifier {
    storage: Database,
}

impl Notifier {
    pub fn new(storage: Database) -> Self {
        Self { storage }
    }

    /// Stores `notification`. Returns `false` when its dedup key was already recorded.
    pub async fn emit(
        &self,
        notification: &NewNotification,
        now: DateTime<Utc>,
    ) -> Result<bool, NotificationStoreError> {
        let inserted = self.storage.notifications().insert(notification, now).await?;
        self.record(notification, inserted);
        Ok(inserted)
    }

    /// Metrics and logs for a notification written elsewhere, e.g. inside a mention
    /// transition's transaction.
    pub fn record(&self, notification: &NewNotification, inserted: bool) {
        if inserted {
            counter!("notifications_emitted_total", "type" => notification.kind.as_str())
                .increment(1);
            info!(
                stage = "notify",
                organization_id = %notification.organization_id,
                kind = notification.kind.as_str(),
                priority = notification.priority.as_str(),
                "notification emitted"
            );
        } else {
            debug!(
                stage = "notify",
                organization_id = %notification.organization_id,
                dedup_key = notification.dedup_key.as_deref().unwrap_or_default(),
                "notification already recorded"
            );
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    limit: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<Notification>>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FEED_LIMIT)
        .clamp(1, MAX_FEED_LIMIT);
    let feed = state
        .storage()
        .notifications()
        .list(&caller.organization_id, query.unread, limit)
        .await
        .map_err(|err| ProblemResponse::internal("notify", err))?;
    Ok(Json(feed))
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let updated = state
        .storage()
        .notifications()
        .mark_read(&caller.organization_id, &id)
        .await
        .map_err(|err| ProblemResponse::internal("notify", err))?;
    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "notification_not_found",
            format!("notification {id} not found"),
        ))
    }
}
