use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use url::Url;

use storypulse_core::retry::RetryPolicy;
use storypulse_instagram::{GraphClient, InstagramOAuthClient};
use storypulse_storage::Database;
use storypulse_util::AppConfig;

use crate::auth::Authenticator;
use crate::evaluator::LifecycleEvaluator;
use crate::notifications::Notifier;
use crate::proxy::OutboundProxy;
use crate::tokens::TokenManager;
use crate::{diagnostics, instagram, mentions, notifications, proxy, webhook};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    authenticator: Authenticator,
    webhook_app_secret: Option<Arc<[u8]>>,
    webhook_verify_token: Option<Arc<str>>,
    graph: GraphClient,
    tokens: TokenManager,
    evaluator: LifecycleEvaluator,
    proxy: OutboundProxy,
    http: Client,
    public_base_url: Url,
}

impl AppState {
    /// Wires every component from `config`. `http` is shared by the Instagram clients
    /// and the diagnostics self-test; the proxy builds its own restricted client.
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        config: &AppConfig,
        http: Client,
    ) -> Result<Self, reqwest::Error> {
        let clock: Clock = Arc::new(Utc::now);
        let policy = RetryPolicy::default();
        let graph = GraphClient::new(config.instagram.graph_base_url.clone(), http.clone());
        let oauth = InstagramOAuthClient::new(
            config.instagram.client_id.clone(),
            config.instagram.client_secret.clone(),
            config.instagram.oauth_base_url.clone(),
            config.instagram.graph_base_url.clone(),
            http.clone(),
        );
        let notifier = Notifier::new(storage.clone());
        let tokens = TokenManager::new(
            storage.clone(),
            oauth,
            graph.clone(),
            notifier.clone(),
            config.instagram.redirect_uri.clone(),
            policy,
        );
        let evaluator = LifecycleEvaluator::new(
            storage.clone(),
            graph.clone(),
            tokens.clone(),
            notifier,
            policy,
            config.verification_mode,
        );
        let proxy = OutboundProxy::new(storage.clone())?;

        Ok(Self {
            metrics,
            storage,
            clock,
            authenticator: Authenticator::new(
                config.auth_token_secret.as_bytes(),
                config.cron_secret.as_bytes(),
            ),
            webhook_app_secret: config
                .webhook_app_secret
                .as_deref()
                .map(|secret| Arc::from(secret.as_bytes())),
            webhook_verify_token: config.webhook_verify_token.as_deref().map(Arc::from),
            graph,
            tokens,
            evaluator,
            proxy,
            http,
            public_base_url: config.public_base_url.clone(),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock.clone();
        self.tokens = self.tokens.with_clock(clock.clone());
        self.evaluator = self.evaluator.with_clock(clock.clone());
        self.proxy = self.proxy.with_clock(clock);
        self
    }

    #[cfg(test)]
    pub fn with_proxy(mut self, proxy: OutboundProxy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Secret used for tenants that have none of their own.
    pub fn webhook_app_secret(&self) -> Option<Arc<[u8]>> {
        self.webhook_app_secret.clone()
    }

    pub fn webhook_verify_token(&self) -> Option<&str> {
        self.webhook_verify_token.as_deref()
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn evaluator(&self) -> &LifecycleEvaluator {
        &self.evaluator
    }

    pub fn proxy(&self) -> &OutboundProxy {
        &self.proxy
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn public_base_url(&self) -> &Url {
        &self.public_base_url
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/webhook",
            get(webhook::verify_subscription).post(webhook::handle),
        )
        .route("/mentions/:id/report-deleted", post(mentions::report_deleted))
        .route("/internal/mentions/resolve", post(mentions::resolve))
        .route("/internal/tokens/check", post(instagram::check_tokens))
        .route("/instagram/status", get(instagram::status))
        .route("/instagram/connect", get(instagram::connect))
        .route("/instagram/callback", get(instagram::callback))
        .route("/instagram/token/refresh", post(instagram::refresh))
        .route("/instagram/disconnect", post(instagram::disconnect))
        .route("/notifications", get(notifications::list))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/proxy", post(proxy::handle))
        .route("/diagnostics", post(diagnostics::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics().render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(test_support::setup_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_pipeline_counters() {
        let app = app_router(test_support::setup_state().await);
        ::metrics::counter!("mentions_ingested_total", "result" => "created").increment(1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("mentions_ingested_total"));
    }
}
