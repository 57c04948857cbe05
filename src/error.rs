//! Application error types

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// The fetched batch has an unusable shape (bad timestamp, missing OHLCV field)
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// The stored table cannot be read, not even to recover a checkpoint
    #[error("Corrupt table for {symbol}: {reason}")]
    CorruptTable { symbol: String, reason: String },

    /// A write to the table, checkpoint or metadata store failed
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// Checkpoint missing keys, truncated or otherwise unparseable
    #[error("Checkpoint unavailable for {symbol}: {reason}")]
    CheckpointUnavailable { symbol: String, reason: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Object storage could not be reached or refused a read
    #[error("Object storage error: {0}")]
    ObjectStore(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn corrupt_table(symbol: &str, reason: impl std::fmt::Display) -> Self {
        AppError::CorruptTable {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn checkpoint_unavailable(symbol: &str, reason: impl std::fmt::Display) -> Self {
        AppError::CheckpointUnavailable {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap any lower-level failure that happened while writing
    pub fn storage_write(context: &str, err: impl std::fmt::Display) -> Self {
        AppError::StorageWrite(format!("{}: {}", context, err))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedBatch(_) => "MALFORMED_BATCH",
            AppError::CorruptTable { .. } => "CORRUPT_TABLE",
            AppError::StorageWrite(_) => "STORAGE_WRITE_ERROR",
            AppError::CheckpointUnavailable { .. } => "CHECKPOINT_UNAVAILABLE",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::ObjectStore(_) => "OBJECT_STORE_ERROR",
            AppError::DuckDb(_) => "DUCKDB_ERROR",
            AppError::Csv(_) => "CSV_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Http(_) => "HTTP_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status used by the REST surface
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedBatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Upstream(_) | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::StorageWrite(_) | AppError::ObjectStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether replaying the whole ingestion may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StorageWrite(_)
                | AppError::ObjectStore(_)
                | AppError::Upstream(_)
                | AppError::Http(_)
        )
    }
}

/// Serializable error response for API clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        ErrorResponse {
            status: "error".to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(err: AppError) -> Self {
        ErrorResponse::from(&err)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
