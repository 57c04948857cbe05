//! Historify - incremental OHLCV ingestion
//!
//! Fetches market history in successive batches and keeps one ordered,
//! duplicate-free table per symbol plus a checkpoint of its time span.
//! Storage backends: CSV files, DuckDB, or memory.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod services;
pub mod sources;
pub mod state;

use api::ApiServer;
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "historify=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Run the API server until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting Historify...");

    let config = AppConfig::from_env()?;
    let state = Arc::new(AppState::new(config)?);
    tracing::info!("Application state initialized");

    let mut server = ApiServer::new(state);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.stop();
    tracing::info!("Historify stopped");
    Ok(())
}
