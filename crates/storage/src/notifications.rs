use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use storypulse_core::types::{NewNotification, Notification, UnknownVariant};

use crate::{sqlite_code, to_rfc3339, SQLITE_CONSTRAINT_FOREIGNKEY};

#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a notification. Returns `false` when one with the same dedup key already exists.
    pub async fn insert(
        &self,
        notification: &NewNotification,
        now: DateTime<Utc>,
    ) -> Result<bool, NotificationStoreError> {
        insert_notification(&self.pool, notification, now).await
    }

    /// Newest-first feed for one organization.
    pub async fn list(
        &self,
        organization_id: &str,
        unread_only: bool,
        limit: u32,
    ) -> Result<Vec<Notification>, NotificationStoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, organization_id, type, message, priority, target_type, target_id, \
                    read_status, created_at \
               FROM notifications \
              WHERE organization_id = ? AND (? = 0 OR read_status = 0) \
              ORDER BY created_at DESC, id DESC \
              LIMIT ?",
        )
        .bind(organization_id)
        .bind(i64::from(unread_only))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Notification::try_from).collect()
    }

    /// Marks a notification read. The only mutation a notification ever receives.
    pub async fn mark_read(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<bool, NotificationStoreError> {
        let done = sqlx::query(
            "UPDATE notifications SET read_status = 1 WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }
}

/// Shared insert used by the repository and by writes that must commit together with it.
pub(crate) async fn insert_notification<'e, E>(
    executor: E,
    notification: &NewNotification,
    now: DateTime<Utc>,
) -> Result<bool, NotificationStoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let done = sqlx::query(
        "INSERT INTO notifications \
         (id, organization_id, type, message, priority, target_type, target_id, dedup_key, read_status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?) \
         ON CONFLICT (organization_id, dedup_key) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&notification.organization_id)
    .bind(notification.kind.as_str())
    .bind(&notification.message)
    .bind(notification.priority.as_str())
    .bind(notification.target_type)
    .bind(&notification.target_id)
    .bind(&notification.dedup_key)
    .bind(to_rfc3339(now))
    .execute(executor)
    .await
    .map_err(|err| {
        if sqlite_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY) {
            NotificationStoreError::MissingOrganization
        } else {
            NotificationStoreError::Database(err)
        }
    })?;
    Ok(done.rows_affected() == 1)
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    organization_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    message: String,
    priority: String,
    target_type: Option<String>,
    target_id: Option<String>,
    read_status: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = NotificationStoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            organization_id: row.organization_id,
            kind: row.kind,
            message: row.message,
            priority: row.priority.parse()?,
            target_type: row.target_type,
            target_id: row.target_id,
            read_status: row.read_status != 0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Error)]
pub enum NotificationStoreError {
    #[error("organization does not exist")]
    MissingOrganization,
    #[error("stored notification is corrupt: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
