use std::sync::Arc;

use axum::http::{header, HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::problem::ProblemResponse;

/// Claims carried by caller bearer tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallerClaims {
    pub sub: String,
    pub org: String,
    pub exp: i64,
}

/// Identity and organization scope of a user-triggered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub organization_id: String,
}

/// Who invoked an internal trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron,
    User(Caller),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid bearer token: {0}")]
    Invalid(String),
}

impl From<AuthError> for ProblemResponse {
    fn from(err: AuthError) -> Self {
        warn!(stage = "auth", error = %err, "request rejected");
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    }
}

/// Validates caller tokens (HS256) and the shared cron secret.
#[derive(Clone)]
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    cron_secret: Arc<[u8]>,
}

impl Authenticator {
    pub fn new(token_secret: &[u8], cron_secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            decoding_key: DecodingKey::from_secret(token_secret),
            validation,
            cron_secret: Arc::from(cron_secret),
        }
    }

    /// Resolves the caller from `Authorization: Bearer <jwt>`.
    pub fn caller(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Result<Caller, AuthError> {
        let token = bearer(headers).ok_or(AuthError::Missing)?;
        self.validate(token, now)
    }

    /// Accepts either the cron secret or a caller token.
    pub fn trigger(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Result<Trigger, AuthError> {
        let token = bearer(headers).ok_or(AuthError::Missing)?;
        if token.as_bytes().ct_eq(&self.cron_secret).into() {
            return Ok(Trigger::Cron);
        }
        self.validate(token, now).map(Trigger::User)
    }

    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Caller, AuthError> {
        let claims = decode::<CallerClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::Invalid(err.to_string()))?
            .claims;
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Invalid("token_expired".to_string()));
        }
        if claims.sub.is_empty() || claims.org.is_empty() {
            return Err(AuthError::Invalid("missing_subject".to_string()));
        }
        Ok(Caller {
            user_id: claims.sub,
            organization_id: claims.org,
        })
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
pub(crate) fn sign_caller_token(secret: &[u8], sub: &str, org: &str, exp: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    encode(
        &Header::new(Algorithm::HS256),
        &CallerClaims {
            sub: sub.to_string(),
            org: org.to_string(),
            exp,
        },
        &EncodingKey::from_secret(secret),
    )
    .expect("encode token")
}
