use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{sqlite_code, to_rfc3339, SQLITE_CONSTRAINT_UNIQUE};

const ORGANIZATION_COLUMNS: &str = "id, name, created_by, webhook_secret, instagram_user_id, \
     instagram_username, last_sync_at, created_at, updated_at";

/// Tenant record. Only the fields the pipeline reads or maintains are mapped.
#[derive(Clone, sqlx::FromRow)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub webhook_secret: Option<String>,
    pub instagram_user_id: Option<String>,
    pub instagram_username: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.created_by == user_id
    }
}

impl fmt::Debug for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Organization")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_by", &self.created_by)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("instagram_user_id", &self.instagram_user_id)
            .field("instagram_username", &self.instagram_username)
            .field("last_sync_at", &self.last_sync_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct OrganizationRepository {
    pool: SqlitePool,
}

impl OrganizationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<Organization>, OrganizationError> {
        let sql = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = ?");
        let org = sqlx::query_as::<_, Organization>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(org)
    }

    /// Finds the organization whose connected Instagram account is `instagram_user_id`.
    pub async fn find_by_instagram_user(
        &self,
        instagram_user_id: &str,
    ) -> Result<Option<Organization>, OrganizationError> {
        let sql = format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE instagram_user_id = ?"
        );
        let org = sqlx::query_as::<_, Organization>(&sql)
            .bind(instagram_user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(org)
    }

    /// Caches the connected account identity on the organization.
    pub async fn update_instagram_identity(
        &self,
        id: &str,
        instagram_user_id: &str,
        instagram_username: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, OrganizationError> {
        let now = to_rfc3339(now);
        let done = sqlx::query(
            "UPDATE organizations \
             SET instagram_user_id = ?, instagram_username = ?, last_sync_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(instagram_user_id)
        .bind(instagram_username)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if sqlite_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE) {
                OrganizationError::InstagramAccountInUse
            } else {
                OrganizationError::Database(err)
            }
        })?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn touch_last_sync(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OrganizationError> {
        let now = to_rfc3339(now);
        sqlx::query("UPDATE organizations SET last_sync_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard-deletes the token row and clears cached identity fields in one transaction.
    ///
    /// Returns whether a token existed. Ownership must be checked by the caller.
    pub async fn disconnect_instagram(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OrganizationError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM organization_instagram_tokens WHERE organization_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE organizations \
             SET instagram_user_id = NULL, instagram_username = NULL, last_sync_at = NULL, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[derive(Debug, Error)]
pub enum OrganizationError {
    #[error("instagram account is already connected to another organization")]
    InstagramAccountInUse,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_organization, setup_db};
    use crate::NewInstagramToken;

    #[tokio::test]
    async fn resolves_tenant_by_instagram_account() {
        let db = setup_db().await;
        let org = db
            .organizations()
            .find_by_instagram_user("ig-org-1")
            .await
            .expect("query")
            .expect("org");
        assert_eq!(org.id, "org-1");
        assert!(org.is_owned_by("owner-1"));
        assert!(!format!("{org:?}").contains("secret\""));
    }

    #[tokio::test]
    async fn identity_is_unique_across_organizations() {
        let db = setup_db().await;
        seed_organization(&db, "org-2", "owner-2", None).await;
        let err = db
            .organizations()
            .update_instagram_identity("org-2", "ig-org-1", Some("taken"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OrganizationError::InstagramAccountInUse));
    }

    #[tokio::test]
    async fn disconnect_removes_token_and_identity() {
        let db = setup_db().await;
        let now = Utc::now();
        db.organizations()
            .update_instagram_identity("org-1", "ig-org-1", Some("brand"), now)
            .await
            .expect("identity");
        db.tokens()
            .upsert(
                &NewInstagramToken {
                    organization_id: "org-1",
                    access_token: "secret-token",
                    token_expires_at: None,
                    instagram_user_id: "ig-org-1",
                },
                now,
            )
            .await
            .expect("token");

        let removed = db
            .organizations()
            .disconnect_instagram("org-1", now)
            .await
            .expect("disconnect");
        assert!(removed);

        assert!(db.tokens().fetch("org-1").await.expect("fetch").is_none());
        let org = db
            .organizations()
            .fetch("org-1")
            .await
            .expect("fetch")
            .expect("org");
        assert!(org.instagram_user_id.is_none());
        assert!(org.instagram_username.is_none());
        assert!(org.last_sync_at.is_none());

        let leftover: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM organization_instagram_tokens WHERE access_token = 'secret-token'",
        )
        .fetch_one(db.pool())
        .await
        .expect("count");
        assert_eq!(leftover.0, 0);
    }
}
