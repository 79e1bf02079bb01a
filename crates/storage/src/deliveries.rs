use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::to_rfc3339;

/// Outcome of one outbound proxy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    UpstreamError,
    Timeout,
    NetworkError,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::UpstreamError => "upstream_error",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
        }
    }
}

pub struct NewDeliveryAttempt<'a> {
    pub request_id: &'a str,
    pub organization_id: &'a str,
    pub user_id: &'a str,
    pub destination_url: &'a str,
    pub status: DeliveryStatus,
    pub upstream_status: Option<u16>,
    pub latency_ms: i64,
    pub error: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub request_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub destination_url: String,
    pub status: String,
    pub upstream_status: Option<i64>,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger of outbound proxy calls keyed by request id.
#[derive(Clone)]
pub struct DeliveryRepository {
    pool: SqlitePool,
}

impl DeliveryRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, attempt: &NewDeliveryAttempt<'_>) -> Result<(), DeliveryError> {
        sqlx::query(
            "INSERT INTO webhook_delivery_attempts \
             (request_id, organization_id, user_id, destination_url, status, upstream_status, latency_ms, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.request_id)
        .bind(attempt.organization_id)
        .bind(attempt.user_id)
        .bind(attempt.destination_url)
        .bind(attempt.status.as_str())
        .bind(attempt.upstream_status.map(i64::from))
        .bind(attempt.latency_ms)
        .bind(attempt.error)
        .bind(to_rfc3339(attempt.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, request_id: &str) -> Result<Option<DeliveryAttempt>, DeliveryError> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT request_id, organization_id, user_id, destination_url, status, \
                    upstream_status, latency_ms, error, created_at \
               FROM webhook_delivery_attempts WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
