//! Upstream market data sources

pub mod yahoo;

use crate::error::Result;
use crate::ingest::RawBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use yahoo::YahooSource;

/// Parameters of one history fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub symbol: String,
    /// `YYYY-MM-DD`; when absent the period (or the source default) applies
    pub start_date: Option<String>,
    /// `YYYY-MM-DD`, exclusive; defaults to today (UTC)
    pub end_date: Option<String>,
    pub interval: String,
    pub period: Option<String>,
    pub auto_adjust: bool,
}

impl FetchRequest {
    pub fn new(symbol: &str, interval: &str, period: Option<&str>) -> Self {
        Self {
            symbol: symbol.to_string(),
            start_date: None,
            end_date: None,
            interval: interval.to_string(),
            period: period.map(String::from),
            auto_adjust: true,
        }
    }
}

/// Source of historical bars plus descriptive metadata for a symbol
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Source ID (e.g., "yahoo")
    fn id(&self) -> &'static str;

    /// Fetch one batch. An empty history is an `Upstream` error.
    async fn fetch(&self, request: &FetchRequest) -> Result<RawBatch>;
}
