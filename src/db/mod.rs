//! Storage backends for OHLCV tables, checkpoints and metadata logs
//!
//! Every backend implements the three store traits below. The ingestion
//! engine only ever talks to the traits, so a `Storage` bundle can be built
//! from the filesystem, DuckDB, an S3 bucket, or the in-memory store used by
//! tests.

pub mod models;
pub mod codec;
pub mod fs;
pub mod duckdb;
pub mod s3;
pub mod memory;

use crate::config::{AppConfig, StorageBackend};
use crate::error::{AppError, Result};
use models::{Checkpoint, MetadataRecord, Row};
use std::sync::Arc;

/// Durable append-only OHLCV table per symbol
pub trait TableStore: Send + Sync {
    /// Whether a table (possibly header-only) exists for the symbol
    fn exists(&self, symbol: &str) -> Result<bool>;

    /// All stored rows in stored order. Unreadable content is `CorruptTable`.
    fn read_all(&self, symbol: &str) -> Result<Vec<Row>>;

    /// Replace the whole table
    fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()>;

    /// Append rows without rewriting existing content.
    /// Callers guarantee the rows are newer than anything stored.
    fn append(&self, symbol: &str, rows: &[Row]) -> Result<()>;
}

/// Durable symbol -> span record
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when absent, `CheckpointUnavailable` when present but unusable
    fn read(&self, symbol: &str) -> Result<Option<Checkpoint>>;

    fn write(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Remove the checkpoint so the next run rederives it from the table
    fn clear(&self, symbol: &str) -> Result<()>;
}

/// Append-only log of metadata snapshots
pub trait MetadataStore: Send + Sync {
    fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()>;
}

/// Store handles for one ingestion, owned by the caller
#[derive(Clone)]
pub struct Storage {
    pub tables: Arc<dyn TableStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub backend: StorageBackend,
}

impl Storage {
    /// Bundle a single backend that implements all three stores
    pub fn from_store<S>(store: Arc<S>, backend: StorageBackend) -> Self
    where
        S: TableStore + CheckpointStore + MetadataStore + 'static,
    {
        Self {
            tables: store.clone(),
            checkpoints: store.clone(),
            metadata: store,
            backend,
        }
    }

    /// Open the backend selected in the configuration
    pub fn open(config: &AppConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Fs => {
                let store = self::fs::FileStore::new(config.data_dir.clone())?;
                tracing::info!("Using filesystem storage at {:?}", config.data_dir);
                Ok(Self::from_store(Arc::new(store), StorageBackend::Fs))
            }
            StorageBackend::DuckDb => {
                std::fs::create_dir_all(&config.data_dir)?;
                let path = config.data_dir.join("historify.duckdb");
                let store = self::duckdb::DuckDb::new(&path)?;
                tracing::info!("Using DuckDB storage at {:?}", path);
                Ok(Self::from_store(Arc::new(store), StorageBackend::DuckDb))
            }
            StorageBackend::S3 => {
                let settings = config.s3.as_ref().ok_or_else(|| {
                    AppError::Config("s3 backend selected without HISTORIFY_S3_BUCKET".to_string())
                })?;
                let store = self::s3::S3Store::new(settings)?;
                Ok(Self::from_store(Arc::new(store), StorageBackend::S3))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; nothing will survive a restart");
                Ok(Self::from_store(
                    Arc::new(memory::MemoryStore::new()),
                    StorageBackend::Memory,
                ))
            }
        }
    }
}

/// Symbols become file names and SQL keys; keep them to a safe alphabet
pub fn validate_symbol(symbol: &str) -> Result<()> {
    let valid = !symbol.is_empty()
        && symbol.len() <= 32
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '^' | '='))
        && symbol != "."
        && symbol != "..";

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid symbol '{}'", symbol)))
    }
}
