//! Services Layer
//!
//! Business logic shared by the REST API handlers and the `fetch_once`
//! binary.
//!
//! # Services
//!
//! - `IngestService` - Normalize, reconcile and log one batch per run
//! - `StockDataService` - Fetch and normalize without storing

pub mod ingest_service;
pub mod stock_data_service;

pub use ingest_service::{CheckpointView, IngestReport, IngestService};
pub use stock_data_service::{StockDataResult, StockDataService};
