//! REST API endpoint handlers

use crate::api::types::*;
use crate::error::{AppError, ErrorResponse};
use crate::ingest::RawBatch;
use crate::services::{CheckpointView, IngestReport, IngestService, StockDataResult, StockDataService};
use crate::state::AppState;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Defaults of `GET /stock-data`; a bare call returns a month of daily bars
const STOCK_DATA_INTERVAL: &str = "1d";

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ErrorResponse>)>;

fn error_response(err: AppError) -> (StatusCode, Json<ErrorResponse>) {
    let status = err.status_code();
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (status, Json(ErrorResponse::from(&err)))
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check endpoint - GET /health or GET /
pub async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::<Empty>::success_with_message("Historify API is running"))
}

// ============================================================================
// Stock data
// ============================================================================

/// Fetch and normalize without storing - GET /stock-data
pub async fn get_stock_data(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StockDataQuery>,
) -> ApiResult<StockDataResult> {
    let request = query.into_request(STOCK_DATA_INTERVAL, None);
    info!("GET /stock-data for {}", request.symbol);

    StockDataService::get_stock_data(&state, &request)
        .await
        .map(|result| Json(ApiResponse::success_with_data(result)))
        .map_err(error_response)
}

/// Fetch from upstream and ingest - GET /stock-data/ingest
pub async fn ingest_from_upstream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StockDataQuery>,
) -> ApiResult<IngestReport> {
    let request = query.into_request(
        &state.config.default_interval,
        state.config.default_period.as_deref(),
    );
    info!("Ingesting {} from {}", request.symbol, state.source.id());

    IngestService::fetch_and_ingest(&state, &request)
        .await
        .map(report_response)
        .map_err(error_response)
}

/// Ingest a batch supplied in the body - POST /stock-data/ingest?symbol=
pub async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
    Json(payload): Json<Value>,
) -> ApiResult<IngestReport> {
    let symbol = query.symbol.trim().to_string();
    info!("Ingesting posted batch for {}", symbol);

    let batch = RawBatch::from_payload(payload).map_err(error_response)?;
    IngestService::ingest_batch(&state, &symbol, batch)
        .await
        .map(report_response)
        .map_err(error_response)
}

fn report_response(report: IngestReport) -> Json<ApiResponse<IngestReport>> {
    let message = report.message();
    Json(ApiResponse::success_with_data(report).with_message(message))
}

/// Current stored range of a symbol - GET /stock-data/checkpoint
pub async fn get_checkpoint(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> ApiResult<CheckpointView> {
    let symbol = query.symbol.trim().to_string();
    let storage = state.storage.clone();

    tokio::task::spawn_blocking(move || IngestService::checkpoint_view(&storage, &symbol))
        .await
        .map_err(|e| AppError::Internal(format!("checkpoint task failed: {}", e)))
        .and_then(|result| result)
        .map(|view| Json(ApiResponse::success_with_data(view)))
        .map_err(error_response)
}
