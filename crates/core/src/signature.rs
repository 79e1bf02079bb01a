use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Reasons a webhook body fails authentication.
///
/// Every variant is reported to callers as the same `signature_mismatch` code so the
/// response does not reveal which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header is missing")]
    MissingHeader,
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("webhook secret is not configured for tenant")]
    SecretNotConfigured,
    #[error("signature does not match payload")]
    Mismatch,
}

impl SignatureError {
    pub fn code(self) -> &'static str {
        "signature_mismatch"
    }

    /// Label used for logs and metrics.
    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_header",
            Self::MalformedHeader => "malformed_header",
            Self::SecretNotConfigured => "secret_not_configured",
            Self::Mismatch => "mismatch",
        }
    }
}

/// Verifies `header` (`sha256=<hex>`) against the HMAC-SHA256 of the exact `body` bytes.
pub fn verify_signature(
    body: &[u8],
    header: Option<&str>,
    secret: Option<&[u8]>,
) -> Result<(), SignatureError> {
    let secret = match secret {
        Some(secret) if !secret.is_empty() => secret,
        _ => return Err(SignatureError::SecretNotConfigured),
    };
    let header = header.ok_or(SignatureError::MissingHeader)?;
    let hex_part = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::MalformedHeader)?;
    let provided = hex::decode(hex_part).map_err(|_| SignatureError::MalformedHeader)?;

    let expected = compute_digest(body, secret);
    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Produces the `sha256=<hex>` header value for `body`.
pub fn sign_payload(body: &[u8], secret: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(compute_digest(body, secret)))
}

fn compute_digest(body: &[u8], secret: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}
