use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use reqwest::{redirect, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use ulid::Ulid;
use url::Url;

use storypulse_core::outbound::{
    check_payload_size, validate_destination, DestinationError, MAX_PAYLOAD_BYTES,
};
use storypulse_storage::{Database, DeliveryStatus, NewDeliveryAttempt};

use crate::auth::Caller;
use crate::problem::ProblemResponse;
use crate::router::{AppState, Clock};

pub const PROXY_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyRequest {
    webhook_url: String,
    #[serde(default)]
    data: Value,
}

/// Body sent upstream: the caller's payload wrapped with its provenance.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub organization_id: &'a str,
    pub user_id: &'a str,
    pub timestamp: String,
    pub request_id: &'a str,
    pub data: Value,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream did not answer within {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },
    #[error("upstream unreachable: {source}")]
    Network {
        request_id: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ProxyError {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Timeout { request_id, .. } | Self::Network { request_id, .. } => request_id,
        }
    }
}

/// Forwards payloads to automation endpoints. One call is one attempt; no retries.
#[derive(Clone)]
pub struct OutboundProxy {
    http: Client,
    storage: Database,
    clock: Clock,
    timeout: Duration,
}

impl OutboundProxy {
    pub fn new(storage: Database) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(PROXY_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            storage,
            clock: Arc::new(Utc::now),
            timeout: PROXY_TIMEOUT,
        })
    }

    /// Swaps the HTTP client. `timeout` must match the one the client was built with.
    #[cfg(test)]
    pub fn with_client(mut self, http: Client, timeout: Duration) -> Self {
        self.http = http;
        self.timeout = timeout;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Sends `data` to an already validated destination and records the attempt.
    pub async fn forward(
        &self,
        caller: &Caller,
        destination: &Url,
        data: Value,
    ) -> Result<ProxyResponse, ProxyError> {
        let now = self.now();
        let request_id = Ulid::new().to_string();
        let envelope = Envelope {
            organization_id: &caller.organization_id,
            user_id: &caller.user_id,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: &request_id,
            data,
        };

        let started = Instant::now();
        let outcome = self.send(destination, &request_id, &envelope).await;
        let elapsed = started.elapsed();
        histogram!("proxy_upstream_seconds").record(elapsed.as_secs_f64());

        let (status, upstream_status, error) = match &outcome {
            Ok(response) if (200..300).contains(&response.status) => {
                (DeliveryStatus::Delivered, Some(response.status), None)
            }
            Ok(response) => (DeliveryStatus::UpstreamError, Some(response.status), None),
            Err(err) if err.is_timeout() => (DeliveryStatus::Timeout, None, Some(err.to_string())),
            Err(err) => (DeliveryStatus::NetworkError, None, Some(err.to_string())),
        };
        counter!("proxy_requests_total", "result" => status.as_str()).increment(1);

        let attempt = NewDeliveryAttempt {
            request_id: &request_id,
            organization_id: &caller.organization_id,
            user_id: &caller.user_id,
            destination_url: destination.as_str(),
            status,
            upstream_status,
            latency_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            error: error.as_deref(),
            created_at: now,
        };
        if let Err(err) = self.storage.deliveries().record(&attempt).await {
            warn!(stage = "proxy", %request_id, error = %err, "failed to record delivery attempt");
        }

        match outcome {
            Ok(response) => {
                info!(
                    stage = "proxy",
                    %request_id,
                    organization_id = %caller.organization_id,
                    host = destination.host_str().unwrap_or_default(),
                    upstream_status = response.status,
                    result = status.as_str(),
                    "proxy call forwarded"
                );
                Ok(response)
            }
            Err(err) if err.is_timeout() => {
                warn!(stage = "proxy", %request_id, "proxy call timed out");
                Err(ProxyError::Timeout {
                    request_id,
                    timeout: self.timeout,
                })
            }
            Err(source) => {
                warn!(stage = "proxy", %request_id, error = %source, "proxy call failed");
                Err(ProxyError::Network { request_id, source })
            }
        }
    }

    async fn send(
        &self,
        destination: &Url,
        request_id: &str,
        envelope: &Envelope<'_>,
    ) -> Result<ProxyResponse, reqwest::Error> {
        let response = self
            .http
            .post(destination.clone())
            .header(REQUEST_ID_HEADER, request_id)
            .json(envelope)
            .send()
            .await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(ProxyResponse {
            request_id: request_id.to_string(),
            status,
            content_type,
            body,
        })
    }
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if let Some(len) = declared {
        check_payload_size(len).map_err(destination_problem)?;
    }
    let bytes = axum::body::to_bytes(body, MAX_PAYLOAD_BYTES)
        .await
        .map_err(|_| destination_problem(DestinationError::PayloadTooLarge))?;

    let request: ProxyRequest = serde_json::from_slice(&bytes).map_err(|err| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_json", err.to_string())
    })?;
    let destination = validate_destination(&request.webhook_url).map_err(|err| {
        counter!("proxy_requests_total", "result" => "rejected").increment(1);
        warn!(
            stage = "proxy",
            organization_id = %caller.organization_id,
            reason = err.code(),
            "proxy destination rejected"
        );
        destination_problem(err)
    })?;

    let forwarded = state
        .proxy()
        .forward(&caller, &destination, request.data)
        .await
        .map_err(|err| {
            let (status, code) = match &err {
                ProxyError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
                ProxyError::Network { .. } => (StatusCode::BAD_GATEWAY, "upstream_unreachable"),
            };
            ProblemResponse::new(
                status,
                code,
                format!("{err} (request {})", err.request_id()),
            )
        })?;

    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, forwarded.body).into_response();
    if let Some(content_type) = forwarded
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    if let Ok(request_id) = HeaderValue::from_str(&forwarded.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    }
    Ok(response)
}

fn destination_problem(err: DestinationError) -> ProblemResponse {
    let status = match err {
        DestinationError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    ProblemResponse::new(status, err.code(), err.to_string())
}
