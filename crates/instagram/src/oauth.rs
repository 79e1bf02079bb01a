use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

/// Client for the Instagram login flow and long-lived token maintenance.
///
/// Code exchange goes through the OAuth host; long-lived exchange and refresh through the Graph host.
#[derive(Clone)]
pub struct InstagramOAuthClient {
    http: Client,
    oauth_base_url: Url,
    graph_base_url: Url,
    client_id: String,
    client_secret: String,
}

impl InstagramOAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        oauth_base_url: Url,
        graph_base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            oauth_base_url,
            graph_base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Builds the consent URL. `state` carries the organization id back to the callback.
    pub fn authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        scopes: &[&str],
    ) -> Result<Url, OAuthError> {
        let mut url = self.oauth_base_url.join("authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(","))
            .append_pair("state", state);
        Ok(url)
    }

    /// Exchanges an authorization code for a short-lived token.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ShortLivedToken, OAuthError> {
        let url = self.oauth_base_url.join("access_token")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("code", code),
            ])
            .send()
            .await
            .map_err(OAuthError::from_http)?;

        let envelope: ShortLivedEnvelope = parse_json(response).await?;
        envelope.into_token().ok_or(OAuthError::EmptyResponse)
    }

    /// Upgrades a short-lived token to a long-lived one (about 60 days).
    pub async fn exchange_long_lived(
        &self,
        short_lived_token: &str,
    ) -> Result<LongLivedToken, OAuthError> {
        let mut url = self.graph_base_url.join("access_token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "ig_exchange_token")
            .append_pair("client_secret", &self.client_secret)
            .append_pair("access_token", short_lived_token);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(OAuthError::from_http)?;
        parse_json(response).await
    }

    /// Extends a still-valid long-lived token.
    pub async fn refresh_long_lived(&self, access_token: &str) -> Result<LongLivedToken, OAuthError> {
        let mut url = self.graph_base_url.join("refresh_access_token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "ig_refresh_token")
            .append_pair("access_token", access_token);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(OAuthError::from_http)?;
        parse_json(response).await
    }
}

/// Token returned by the code exchange.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ShortLivedToken {
    pub access_token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ShortLivedEnvelope {
    Wrapped { data: Vec<ShortLivedToken> },
    Flat(ShortLivedToken),
}

impl ShortLivedEnvelope {
    fn into_token(self) -> Option<ShortLivedToken> {
        match self {
            Self::Wrapped { data } => data.into_iter().next(),
            Self::Flat(token) => Some(token),
        }
    }
}

/// Long-lived token issued by exchange or refresh.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LongLivedToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: i64,
}

impl LongLivedToken {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in)
    }
}

/// Errors that can occur during OAuth interactions.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("token response carried no token")]
    EmptyResponse,
}

impl OAuthError {
    /// Wraps a transport error without the request URL, which may carry token material.
    fn from_http(err: reqwest::Error) -> Self {
        Self::Http(err.without_url())
    }
}

async fn parse_json<T>(response: Response) -> Result<T, OAuthError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(OAuthError::Status { status, body });
    }

    response.json().await.map_err(OAuthError::from_http)
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(value) => value,
        Id::Number(value) => value.to_string(),
    })
}
