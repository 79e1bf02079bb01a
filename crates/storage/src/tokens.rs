use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{sqlite_code, to_rfc3339, SQLITE_CONSTRAINT_FOREIGNKEY};

const TOKEN_COLUMNS: &str = "organization_id, access_token, token_expires_at, instagram_user_id, \
     refresh_started_at, refresh_failures, last_refresh_attempt_at, last_refresh_error, \
     created_at, updated_at";

/// Long-lived Instagram credential held for one organization.
#[derive(Clone, sqlx::FromRow)]
pub struct InstagramToken {
    pub organization_id: String,
    pub access_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub instagram_user_id: String,
    /// Set while a refresh is in flight.
    pub refresh_started_at: Option<DateTime<Utc>>,
    pub refresh_failures: i64,
    pub last_refresh_attempt_at: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for InstagramToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramToken")
            .field("organization_id", &self.organization_id)
            .field("access_token", &"<redacted>")
            .field("token_expires_at", &self.token_expires_at)
            .field("instagram_user_id", &self.instagram_user_id)
            .field("refresh_started_at", &self.refresh_started_at)
            .field("refresh_failures", &self.refresh_failures)
            .finish_non_exhaustive()
    }
}

/// Token material obtained from a successful OAuth exchange.
pub struct NewInstagramToken<'a> {
    pub organization_id: &'a str,
    pub access_token: &'a str,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub instagram_user_id: &'a str,
}

/// Repository for `organization_instagram_tokens`.
#[derive(Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
}

impl TokenRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(
        &self,
        organization_id: &str,
    ) -> Result<Option<InstagramToken>, TokenStoreError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM organization_instagram_tokens WHERE organization_id = ?"
        );
        let token = sqlx::query_as::<_, InstagramToken>(&sql)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn list_all(&self) -> Result<Vec<InstagramToken>, TokenStoreError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM organization_instagram_tokens ORDER BY organization_id"
        );
        let tokens = sqlx::query_as::<_, InstagramToken>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(tokens)
    }

    /// Stores the organization's token, replacing any previous one and clearing refresh state.
    pub async fn upsert(
        &self,
        token: &NewInstagramToken<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), TokenStoreError> {
        let now = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO organization_instagram_tokens \
             (organization_id, access_token, token_expires_at, instagram_user_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (organization_id) DO UPDATE SET \
                 access_token = excluded.access_token, \
                 token_expires_at = excluded.token_expires_at, \
                 instagram_user_id = excluded.instagram_user_id, \
                 refresh_started_at = NULL, \
                 refresh_failures = 0, \
                 last_refresh_error = NULL, \
                 updated_at = excluded.updated_at",
        )
        .bind(token.organization_id)
        .bind(token.access_token)
        .bind(token.token_expires_at.map(to_rfc3339))
        .bind(token.instagram_user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if sqlite_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY) {
                TokenStoreError::MissingOrganization
            } else {
                TokenStoreError::Database(err)
            }
        })?;
        Ok(())
    }

    /// Claims the refresh marker. At most one caller wins until the marker is released or
    /// becomes older than `stale_before`.
    pub async fn try_begin_refresh(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError> {
        let now = to_rfc3339(now);
        let done = sqlx::query(
            "UPDATE organization_instagram_tokens \
             SET refresh_started_at = ?, last_refresh_attempt_at = ? \
             WHERE organization_id = ? \
               AND (refresh_started_at IS NULL OR refresh_started_at < ?)",
        )
        .bind(&now)
        .bind(&now)
        .bind(organization_id)
        .bind(to_rfc3339(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Replaces the token in place and releases the refresh marker.
    pub async fn complete_refresh(
        &self,
        organization_id: &str,
        access_token: &str,
        token_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError> {
        let done = sqlx::query(
            "UPDATE organization_instagram_tokens \
             SET access_token = ?, token_expires_at = ?, refresh_started_at = NULL, \
                 refresh_failures = 0, last_refresh_error = NULL, updated_at = ? \
             WHERE organization_id = ?",
        )
        .bind(access_token)
        .bind(token_expires_at.map(to_rfc3339))
        .bind(to_rfc3339(now))
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Releases the refresh marker after a failure. The stored token is kept.
    pub async fn fail_refresh(
        &self,
        organization_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TokenStoreError> {
        sqlx::query(
            "UPDATE organization_instagram_tokens \
             SET refresh_started_at = NULL, refresh_failures = refresh_failures + 1, \
                 last_refresh_error = ?, updated_at = ? \
             WHERE organization_id = ?",
        )
        .bind(error)
        .bind(to_rfc3339(now))
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("organization does not exist")]
    MissingOrganization,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use chrono::Duration;

    fn token<'a>(access_token: &'a str, expires_at: DateTime<Utc>) -> NewInstagramToken<'a> {
        NewInstagramToken {
            organization_id: "org-1",
            access_token,
            token_expires_at: Some(expires_at),
            instagram_user_id: "ig-org-1",
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_token() {
        let db = setup_db().await;
        let repo = db.tokens();
        let now = Utc::now();
        repo.upsert(&token("first", now + Duration::days(60)), now)
            .await
            .expect("insert");
        repo.upsert(&token("second", now + Duration::days(59)), now)
            .await
            .expect("update");

        let stored = repo.fetch("org-1").await.expect("fetch").expect("row");
        assert_eq!(stored.access_token, "second");
        assert_eq!(repo.list_all().await.expect("list").len(), 1);
        assert!(!format!("{stored:?}").contains("second"));
    }

    #[tokio::test]
    async fn upsert_requires_organization() {
        let db = setup_db().await;
        let err = db
            .tokens()
            .upsert(
                &NewInstagramToken {
                    organization_id: "missing",
                    access_token: "t",
                    token_expires_at: None,
                    instagram_user_id: "ig",
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TokenStoreError::MissingOrganization));
    }

    #[tokio::test]
    async fn refresh_marker_allows_one_holder() {
        let db = setup_db().await;
        let repo = db.tokens();
        let now = Utc::now();
        repo.upsert(&token("t", now + Duration::hours(12)), now)
            .await
            .expect("insert");

        let stale_before = now - Duration::minutes(30);
        assert!(repo.try_begin_refresh("org-1", now, stale_before).await.expect("claim"));
        assert!(!repo.try_begin_refresh("org-1", now, stale_before).await.expect("second claim"));

        let later = now + Duration::hours(1);
        assert!(repo
            .try_begin_refresh("org-1", later, later - Duration::minutes(30))
            .await
            .expect("stale claim"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_token_and_releases_marker() {
        let db = setup_db().await;
        let repo = db.tokens();
        let now = Utc::now();
        repo.upsert(&token("keep-me", now + Duration::hours(12)), now)
            .await
            .expect("insert");
        repo.try_begin_refresh("org-1", now, now).await.expect("claim");
        repo.fail_refresh("org-1", "provider said no", now).await.expect("fail");

        let stored = repo.fetch("org-1").await.expect("fetch").expect("row");
        assert_eq!(stored.access_token, "keep-me");
        assert_eq!(stored.refresh_failures, 1);
        assert!(stored.refresh_started_at.is_none());
        assert_eq!(stored.last_refresh_error.as_deref(), Some("provider said no"));

        let new_expiry = now + Duration::days(60);
        assert!(repo
            .complete_refresh("org-1", "fresh", Some(new_expiry), now)
            .await
            .expect("complete"));
        let stored = repo.fetch("org-1").await.expect("fetch").expect("row");
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_failures, 0);
    }
}
