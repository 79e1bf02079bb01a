mod auth;
mod diagnostics;
mod evaluator;
mod instagram;
mod mentions;
mod notifications;
mod problem;
mod proxy;
mod router;
mod telemetry;
mod tokens;
mod webhook;

use std::net::SocketAddr;
use std::time::Duration;

use storypulse_storage::Database;
use storypulse_util::{load_env_file, AppConfig};
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let state = router::AppState::new(metrics, database, &config, http)?;

    state.evaluator().clone().spawn(config.evaluator_interval);
    state.tokens().clone().spawn(config.token_check_interval);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        verification_mode = config.verification_mode.as_str(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
