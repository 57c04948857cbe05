//! Stock Data Service
//!
//! Fetches history from the upstream source and returns it normalized,
//! without touching storage.

use crate::db::models::Row;
use crate::db::validate_symbol;
use crate::error::Result;
use crate::ingest::normalize;
use crate::sources::FetchRequest;
use crate::state::AppState;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

/// Normalized fetch result
#[derive(Debug, Clone, Serialize)]
pub struct StockDataResult {
    pub symbol: String,
    pub interval: String,
    pub source: &'static str,
    pub metadata: BTreeMap<String, Value>,
    pub rows: Vec<Row>,
}

pub struct StockDataService;

impl StockDataService {
    pub async fn get_stock_data(state: &AppState, request: &FetchRequest) -> Result<StockDataResult> {
        validate_symbol(&request.symbol)?;
        info!(
            "StockDataService::get_stock_data - {} {} via {}",
            request.symbol,
            request.interval,
            state.source.id()
        );

        let batch = state.source.fetch(request).await?;
        let normalized = normalize(batch)?;

        Ok(StockDataResult {
            symbol: request.symbol.clone(),
            interval: request.interval.clone(),
            source: state.source.id(),
            metadata: normalized.metadata,
            rows: normalized.rows,
        })
    }
}
