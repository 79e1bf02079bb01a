use std::sync::{Mutex, PoisonError};

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use storypulse_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// Pretty logs for development and tests, JSON lines in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let fmt_layer = match config.environment {
        Environment::Production => base.json().boxed(),
        Environment::Development | Environment::Test => {
            base.event_format(tracing_fmt::format().pretty()).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = env!("CARGO_PKG_VERSION"),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the global Prometheus recorder once; later calls share its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    static INSTALLED: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_pipeline_metrics();
    *installed = Some(handle.clone());
    Ok(handle)
}

fn describe_pipeline_metrics() {
    describe_counter!("webhook_ingress_total", "Inbound webhooks by result");
    describe_counter!(
        "webhook_invalid_signature_total",
        "Webhooks rejected before persistence, by reason"
    );
    describe_histogram!(
        "webhook_ack_latency_seconds",
        "Time to acknowledge an inbound webhook"
    );
    describe_counter!("mentions_ingested_total", "Mention writes, created or duplicate");
    describe_counter!("normalizer_dropped_total", "Messaging items dropped, by reason");
    describe_counter!("evaluator_transitions_total", "Terminal mention transitions, by state");
    describe_counter!("evaluator_verification_total", "Story verification probes, by outcome");
    describe_histogram!("evaluator_run_seconds", "Duration of one evaluator pass");
    describe_counter!("notifications_emitted_total", "Notifications stored, by type");
    describe_counter!("token_refresh_total", "Token refresh attempts, by result");
    describe_counter!("proxy_requests_total", "Outbound proxy calls, by result");
    describe_histogram!("proxy_upstream_seconds", "Upstream latency of outbound proxy calls");
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn repeated_init_shares_one_recorder() {
        let first = init_metrics().expect("init");
        let second = init_metrics().expect("init again");

        counter!("token_refresh_total", "result" => "success").increment(1);
        assert!(first.render().contains("token_refresh_total"));
        assert!(second.render().contains("token_refresh_total"));
    }
}
