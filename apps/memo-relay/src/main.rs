use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use memo_relay::config::{Cli, ServerConfig};
use memo_relay::server::{self, AppState};
use memo_relay::telemetry::Telemetry;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        api_base_url = %config.api_base_url,
        auth_cookie = %config.auth_cookie,
        bridge_timeout_secs = config.bridge_timeout.as_secs(),
        "starting memo-relay"
    );

    let state = Arc::new(AppState::from_config(&config, Some(telemetry.metrics_handle()))?);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("memo-relay listening on {}", config.listen_addr);

    server::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
