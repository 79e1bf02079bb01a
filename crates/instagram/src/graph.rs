use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

use crate::oauth::string_or_number;

/// Graph error code for an expired or revoked access token.
pub const INVALID_TOKEN_CODE: i64 = 190;
/// Graph error code returned when the requested object does not exist or is not visible.
pub const OBJECT_NOT_FOUND_CODE: i64 = 100;

/// Client for the Graph endpoints the pipeline reads.
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
}

impl GraphClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// "Who am I" probe for the token owner.
    pub async fn me(&self, access_token: &str) -> Result<GraphUser, GraphError> {
        let mut url = self.endpoint(&["me"])?;
        url.query_pairs_mut()
            .append_pair("fields", "user_id,username,account_type");
        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await
            .map_err(GraphError::from_http)?;
        parse_json(response).await
    }

    /// Reads profile fields that require the basic profile permission.
    pub async fn profile(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<GraphProfile, GraphError> {
        let mut url = self.endpoint(&[user_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "id,username,media_count,followers_count");
        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await
            .map_err(GraphError::from_http)?;
        parse_json(response).await
    }

    /// Succeeds when the token may read media the account is tagged in.
    pub async fn probe_mentions(&self, access_token: &str, user_id: &str) -> Result<(), GraphError> {
        self.probe_edge(access_token, user_id, "tags").await
    }

    /// Succeeds when the token may list the account's active stories.
    pub async fn probe_stories(&self, access_token: &str, user_id: &str) -> Result<(), GraphError> {
        self.probe_edge(access_token, user_id, "stories").await
    }

    /// Asks the provider whether a story object still resolves.
    pub async fn story_status(
        &self,
        access_token: &str,
        story_id: &str,
    ) -> Result<StoryStatus, GraphError> {
        let mut url = self.endpoint(&[story_id])?;
        url.query_pairs_mut().append_pair("fields", "id");
        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await
            .map_err(GraphError::from_http)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StoryStatus::Gone);
        }
        match parse_json::<ObjectId>(response).await {
            Ok(_) => Ok(StoryStatus::Live),
            Err(GraphError::Api { code, .. }) if code == OBJECT_NOT_FOUND_CODE => {
                Ok(StoryStatus::Gone)
            }
            Err(err) => Err(err),
        }
    }

    async fn probe_edge(
        &self,
        access_token: &str,
        user_id: &str,
        edge: &str,
    ) -> Result<(), GraphError> {
        let mut url = self.endpoint(&[user_id, edge])?;
        url.query_pairs_mut()
            .append_pair("fields", "id")
            .append_pair("limit", "1");
        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await
            .map_err(GraphError::from_http)?;
        parse_json::<serde_json::Value>(response).await.map(|_| ())
    }

    /// Appends each of `segments` to the base path as a single encoded segment, so ids taken
    /// from webhooks can never replace the host or climb out of the base path.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, GraphError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| GraphError::BaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Token owner as reported by `/me`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GraphUser {
    /// Professional account id, the one webhooks address as `entry[].id`.
    #[serde(default, deserialize_with = "some_string_or_number")]
    pub user_id: Option<String>,
    /// App-scoped id.
    #[serde(default, deserialize_with = "some_string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub account_type: Option<String>,
}

impl GraphUser {
    pub fn account_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.id.as_deref())
    }
}

fn some_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    string_or_number(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GraphProfile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub media_count: Option<u64>,
    #[serde(default)]
    pub followers_count: Option<u64>,
}

#[derive(Deserialize)]
struct ObjectId {
    #[allow(dead_code)]
    id: String,
}

/// Whether a story object is still served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryStatus {
    Live,
    Gone,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

/// Errors that can occur while calling the Graph API.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph base url cannot carry a path")]
    BaseUrl,
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("graph api error {code} ({status}): {message}")]
    Api {
        status: StatusCode,
        code: i64,
        message: String,
    },
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl GraphError {
    fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err.without_url())
        }
    }

    /// True when the provider rejected the credential itself.
    pub fn is_invalid_token(&self) -> bool {
        match self {
            Self::Api { code, .. } => *code == INVALID_TOKEN_CODE,
            Self::Status { status, .. } => *status == StatusCode::UNAUTHORIZED,
            _ => false,
        }
    }

    /// True when the request was understood but the token lacks the permission.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                *status == StatusCode::FORBIDDEN || matches!(*code, 10 | 200..=299)
            }
            Self::Status { status, .. } => *status == StatusCode::FORBIDDEN,
            _ => false,
        }
    }
}

async fn parse_json<T>(response: Response) -> Result<T, GraphError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            return Err(GraphError::Api {
                status,
                code: envelope.error.code,
                message: envelope.error.message,
            });
        }
        return Err(GraphError::Status { status, body });
    }

    response.json().await.map_err(GraphError::from_http)
}
