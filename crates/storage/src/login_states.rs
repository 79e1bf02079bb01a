use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{sqlite_code, to_rfc3339, SQLITE_CONSTRAINT_FOREIGNKEY};

/// OAuth authorization started by a signed-in user and awaiting its callback.
#[derive(Clone, sqlx::FromRow)]
pub struct LoginState {
    pub state: String,
    pub organization_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LoginState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginState")
            .field("state", &"<redacted>")
            .field("organization_id", &self.organization_id)
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct NewLoginState<'a> {
    pub state: &'a str,
    pub organization_id: &'a str,
    pub user_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Repository for `oauth_login_states`. A state is handed out once and consumed once.
#[derive(Clone)]
pub struct LoginStateRepository {
    pool: SqlitePool,
}

impl LoginStateRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, login: &NewLoginState<'_>) -> Result<(), LoginStateError> {
        sqlx::query(
            "INSERT INTO oauth_login_states (state, organization_id, user_id, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(login.state)
        .bind(login.organization_id)
        .bind(login.user_id)
        .bind(to_rfc3339(login.created_at))
        .bind(to_rfc3339(login.expires_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if sqlite_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY) {
                LoginStateError::MissingOrganization
            } else {
                LoginStateError::Database(err)
            }
        })?;
        Ok(())
    }

    /// Removes and returns the stored state. A second call with the same value yields `None`.
    ///
    /// Expired rows are still returned so the caller can tell "expired" from "unknown".
    pub async fn consume(&self, state: &str) -> Result<Option<LoginState>, LoginStateError> {
        let login = sqlx::query_as::<_, LoginState>(
            "DELETE FROM oauth_login_states WHERE state = ? \
             RETURNING state, organization_id, user_id, created_at, expires_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        Ok(login)
    }

    /// Drops abandoned authorizations.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LoginStateError> {
        let done = sqlx::query("DELETE FROM oauth_login_states WHERE expires_at <= ?")
            .bind(to_rfc3339(now))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum LoginStateError {
    #[error("organization does not exist")]
    MissingOrganization,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
