use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use mcp_injector::{
    config::{AppConfig, Cli},
    handler,
    state::AppState,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.clone()))
        .init();

    let config = AppConfig::load(cli).context("loading configuration")?;
    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, servers = config.mcp_servers.len(), "starting mcp-injector");

    let state = AppState::new(config);

    tokio::spawn({
        let state = state.clone();
        async move {
            state.registry.warm_up().await;
            state.warming_up.store(false, Ordering::Relaxed);
            info!("warm-up complete");
        }
    });

    let app = handler::app(state);

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(%addr, error = %e, "failed to bind");
            return Err(e).context(format!("binding {addr}"));
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining in-flight requests");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
