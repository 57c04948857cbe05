//! Fetch Once CLI
//!
//! Runs a single fetch + ingest for one symbol and prints the report.
//!
//! Usage:
//!   cargo run --bin fetch_once
//!   cargo run --bin fetch_once -- --symbol AAPL --interval 1d --period 5d
//!   cargo run --bin fetch_once -- --symbol TSLA --start 2024-01-01 --end 2024-02-01

use anyhow::{Context, Result};
use clap::Parser;
use historify_lib::config::{AppConfig, S3Config, StorageBackend};
use historify_lib::services::IngestService;
use historify_lib::sources::FetchRequest;
use historify_lib::state::AppState;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetch_once")]
#[command(about = "Fetch one batch of market history and merge it into storage")]
struct Args {
    /// Ticker symbol
    #[arg(long, default_value = "TSLA")]
    symbol: String,

    /// Start date (YYYY-MM-DD); overrides the period
    #[arg(long)]
    start: Option<String>,

    /// End date (YYYY-MM-DD, exclusive); defaults to today
    #[arg(long)]
    end: Option<String>,

    /// Bar interval
    #[arg(long, default_value = "1m")]
    interval: String,

    /// Lookback period used when no start date is given
    #[arg(long, default_value = "1d")]
    period: String,

    /// Scale OHLC by the adjusted close
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    auto_adjust: bool,

    /// Data directory (overrides HISTORIFY_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Storage backend: fs, duckdb, s3 or memory (overrides HISTORIFY_BACKEND)
    #[arg(long)]
    backend: Option<StorageBackend>,
}

#[tokio::main]
async fn main() -> Result<()> {
    historify_lib::init_tracing();
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
        if backend == StorageBackend::S3 && config.s3.is_none() {
            config.s3 = Some(S3Config::from_env().context("Failed to load S3 settings")?);
        }
    }

    let state = AppState::new(config).context("Failed to open storage")?;

    let request = FetchRequest {
        symbol: args.symbol,
        period: args.start.is_none().then_some(args.period),
        start_date: args.start,
        end_date: args.end,
        interval: args.interval,
        auto_adjust: args.auto_adjust,
    };

    let report = IngestService::fetch_and_ingest(&state, &request)
        .await
        .with_context(|| format!("Ingestion of {} failed", request.symbol))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
