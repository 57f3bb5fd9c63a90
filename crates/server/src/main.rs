//! Netchecker server - collects keepalive reports from netchecker agents
//!
//! Agents POST a report every interval; the server answers whether every
//! expected agent is reporting in time.

use anyhow::Result;
use netchecker_server::{api, config::ServerConfig};
use server_lib::{
    open_membership, open_store, AgentMetrics, CacheJanitor, StructuredLogger, SweepLoop,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting netchecker-server");

    let config = ServerConfig::load()?;
    info!(
        listen_addr = %config.listen_addr,
        backend = ?config.storage.backend,
        membership = config.membership.enabled,
        "Server configured"
    );

    // Cancelled on SIGINT; aborts startup waits and stops background tasks
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            shutdown.cancel();
        }
    });

    let metrics = AgentMetrics::new();
    let opened = open_store(&config.storage, metrics.clone(), shutdown.clone()).await?;
    let store = opened.store;
    let logger = StructuredLogger::new(store.name());

    let membership =
        open_membership(&config.membership, config.storage.request_timeout()).await?;
    let janitor = Arc::new(CacheJanitor::new(store.clone(), membership, logger.clone()));

    let sweep = SweepLoop::new(janitor.clone(), store.clone(), metrics.clone(), config.sweep());
    let sweep_handle = tokio::spawn(sweep.run(shutdown.clone()));

    let app_state = Arc::new(api::AppState::new(store, janitor, metrics, logger.clone()));
    logger.log_startup(SERVER_VERSION, &config.listen_addr);

    let served = api::serve(config.listen_addr.clone(), app_state, shutdown.clone()).await;

    // The API may also stop on its own (bind failure); take the rest down with it
    shutdown.cancel();
    logger.log_shutdown(if served.is_ok() { "SIGINT received" } else { "API server failed" });

    let _ = sweep_handle.await;
    if let Some(reconciler) = opened.reconciler {
        let _ = reconciler.await;
    }
    info!("Shutting down");

    served
}
