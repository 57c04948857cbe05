//! Ingest Service
//!
//! One ingestion run for a symbol: normalize the batch, reconcile it against
//! the stored table, then log the batch metadata. Called by the REST API and
//! the `fetch_once` binary.

use crate::db::models::Checkpoint;
use crate::db::{validate_symbol, Storage};
use crate::error::{AppError, Result};
use crate::ingest::{
    append_snapshot, normalize, reconcile, resolve_range, IngestStatus, RangeSource, RawBatch,
};
use crate::sources::FetchRequest;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub symbol: String,
    pub status: IngestStatus,
    pub rows_received: usize,
    pub rows_added: usize,
    pub checkpoint: Option<Checkpoint>,
    pub range_source: RangeSource,
    pub metadata_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl IngestReport {
    pub fn message(&self) -> String {
        match self.status {
            IngestStatus::Created => format!(
                "Initial data for {} stored ({} rows)",
                self.symbol, self.rows_added
            ),
            IngestStatus::Appended => format!(
                "Appended {} new rows for {}",
                self.rows_added, self.symbol
            ),
            IngestStatus::UpToDate => format!("No new data for {}", self.symbol),
        }
    }
}

/// Current stored range of a symbol
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointView {
    pub symbol: String,
    pub table_exists: bool,
    pub range_source: Option<RangeSource>,
    pub checkpoint: Option<Checkpoint>,
}

/// Ingest service for business logic
pub struct IngestService;

impl IngestService {
    /// Ingest a batch now
    pub fn ingest(storage: &Storage, symbol: &str, batch: RawBatch) -> Result<IngestReport> {
        Self::ingest_at(storage, symbol, batch, Utc::now())
    }

    /// Ingest a batch, stamping the metadata snapshot with `ingested_at`.
    ///
    /// Blocking; callers on the async runtime go through `ingest_blocking`.
    pub fn ingest_at(
        storage: &Storage,
        symbol: &str,
        batch: RawBatch,
        ingested_at: DateTime<Utc>,
    ) -> Result<IngestReport> {
        validate_symbol(symbol)?;
        let run_id = Uuid::new_v4();
        let rows_received = batch.rows.len();
        info!(
            "IngestService::ingest - run {} for {} ({} rows, backend {})",
            run_id, symbol, rows_received, storage.backend
        );

        let normalized = normalize(batch)?;
        let outcome = reconcile(
            storage.tables.as_ref(),
            storage.checkpoints.as_ref(),
            symbol,
            &normalized.rows,
        )?;

        // Rows and checkpoint are committed; a metadata failure only gets reported
        let metadata_error = match append_snapshot(
            storage.metadata.as_ref(),
            symbol,
            &normalized.metadata,
            ingested_at,
        ) {
            Ok(_) => None,
            Err(e) => {
                warn!("Metadata snapshot for {} not recorded: {}", symbol, e);
                Some(e.to_string())
            }
        };

        let report = IngestReport {
            run_id,
            symbol: symbol.to_string(),
            status: outcome.status,
            rows_received,
            rows_added: outcome.rows_added,
            checkpoint: outcome.checkpoint,
            range_source: outcome.range_source,
            metadata_recorded: metadata_error.is_none(),
            metadata_error,
            ingested_at,
        };
        info!("{}", report.message());
        Ok(report)
    }

    /// Run `ingest` on the blocking pool.
    ///
    /// The symbol guard moves into the blocking task and is released only
    /// when the write finishes, even if the calling future is dropped.
    pub async fn ingest_blocking(
        storage: Storage,
        symbol: String,
        batch: RawBatch,
        guard: OwnedMutexGuard<()>,
    ) -> Result<IngestReport> {
        tokio::task::spawn_blocking(move || {
            let report = Self::ingest(&storage, &symbol, batch);
            drop(guard);
            report
        })
        .await
        .map_err(|e| AppError::Internal(format!("ingest task failed: {}", e)))?
    }

    /// Ingest a caller-supplied batch while holding the symbol lock
    pub async fn ingest_batch(state: &AppState, symbol: &str, batch: RawBatch) -> Result<IngestReport> {
        validate_symbol(symbol)?;
        let guard = state.lock_symbol(symbol).await;
        Self::ingest_blocking(state.storage.clone(), symbol.to_string(), batch, guard).await
    }

    /// Fetch from the upstream source and ingest the result
    pub async fn fetch_and_ingest(state: &AppState, request: &FetchRequest) -> Result<IngestReport> {
        validate_symbol(&request.symbol)?;
        let guard = state.lock_symbol(&request.symbol).await;

        let batch = state.source.fetch(request).await?;
        Self::ingest_blocking(state.storage.clone(), request.symbol.clone(), batch, guard).await
    }

    /// Resolve the stored range without changing anything
    pub fn checkpoint_view(storage: &Storage, symbol: &str) -> Result<CheckpointView> {
        validate_symbol(symbol)?;

        if !storage.tables.exists(symbol)? {
            return Ok(CheckpointView {
                symbol: symbol.to_string(),
                table_exists: false,
                range_source: None,
                checkpoint: None,
            });
        }

        let resolution = resolve_range(storage.tables.as_ref(), storage.checkpoints.as_ref(), symbol)?;
        Ok(CheckpointView {
            symbol: symbol.to_string(),
            table_exists: true,
            range_source: Some(resolution.source()),
            checkpoint: resolution.checkpoint().cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StorageBackend};
    use crate::db::memory::MemoryStore;
    use crate::db::models::parse_timestamp;
    use crate::db::{CheckpointStore, TableStore};
    use crate::sources::stub::StubSource;
    use crate::db::models::{MetadataRecord, Row};
    use crate::db::MetadataStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(timestamps: &[&str]) -> RawBatch {
        RawBatch::from_payload(json!({
            "symbol": "TSLA",
            "currency": "USD",
            "data_evolution": timestamps
                .iter()
                .map(|ts| json!({
                    "datetime": ts,
                    "open": 248.0, "high": 249.5, "low": 247.5, "close": 249.0,
                    "volume": 1200
                }))
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    fn storage() -> (Arc<MemoryStore>, Storage) {
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::from_store(store.clone(), StorageBackend::Memory);
        (store, storage)
    }

    #[test]
    fn test_ingest_reports_each_protocol() {
        let (store, storage) = storage();

        let first = IngestService::ingest(
            &storage,
            "TSLA",
            batch(&["2024-01-02 14:31:00", "2024-01-02 14:30:00"]),
        )
        .unwrap();
        assert_eq!(first.status, IngestStatus::Created);
        assert_eq!(first.rows_received, 2);
        assert_eq!(first.rows_added, 2);
        assert!(first.metadata_recorded);

        let second = IngestService::ingest(
            &storage,
            "TSLA",
            batch(&["2024-01-02 14:31:00", "2024-01-02 14:32:00"]),
        )
        .unwrap();
        assert_eq!(second.status, IngestStatus::Appended);
        assert_eq!(second.rows_added, 1);

        let third = IngestService::ingest(&storage, "TSLA", batch(&["2024-01-02 14:30:00"])).unwrap();
        assert_eq!(third.status, IngestStatus::UpToDate);

        // Metadata is logged on every run, including no-op ones
        assert_eq!(store.metadata_log("TSLA").len(), 3);
        assert_eq!(store.read_all("TSLA").unwrap().len(), 3);
    }

    #[test]
    fn test_metadata_failure_keeps_rows() {
        let (store, storage) = storage();
        store.set_fail_metadata_writes(true);

        let report = IngestService::ingest(&storage, "TSLA", batch(&["2024-01-02 14:30:00"])).unwrap();
        assert_eq!(report.status, IngestStatus::Created);
        assert!(!report.metadata_recorded);
        assert!(report.metadata_error.is_some());
        assert_eq!(store.read_all("TSLA").unwrap().len(), 1);
        assert!(store.read("TSLA").unwrap().is_some());
    }

    #[test]
    fn test_malformed_batch_writes_nothing() {
        let (store, storage) = storage();
        let bad = RawBatch::from_payload(json!({
            "data_evolution": [{"datetime": "yesterday", "open": 1, "high": 1, "low": 1, "close": 1, "volume": 1}]
        }))
        .unwrap();

        let err = IngestService::ingest(&storage, "TSLA", bad).unwrap_err();
        assert!(matches!(err, AppError::MalformedBatch(_)));
        assert!(!store.exists("TSLA").unwrap());
        assert!(store.metadata_log("TSLA").is_empty());
    }

    #[test]
    fn test_rejects_unsafe_symbol() {
        let (_, storage) = storage();
        let err = IngestService::ingest(&storage, "../etc", batch(&[])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_checkpoint_view() {
        let (store, storage) = storage();
        let view = IngestService::checkpoint_view(&storage, "TSLA").unwrap();
        assert!(!view.table_exists);
        assert!(view.checkpoint.is_none());

        IngestService::ingest(&storage, "TSLA", batch(&["2024-01-02 14:30:00"])).unwrap();
        store.clear("TSLA").unwrap();

        let view = IngestService::checkpoint_view(&storage, "TSLA").unwrap();
        assert_eq!(view.range_source, Some(RangeSource::RecoveredFromTable));
        assert_eq!(
            view.checkpoint.map(|cp| cp.range_end),
            parse_timestamp("2024-01-02 14:30:00")
        );
        // Viewing never rewrites the checkpoint
        assert!(store.read("TSLA").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_and_ingest() {
        let (store, storage) = storage();
        let source = Arc::new(StubSource::with_batches(vec![batch(&["2024-01-02 14:30:00"])]));
        let state = AppState::with_parts(AppConfig::default(), storage, source.clone());
        let request = FetchRequest::new("TSLA", "1m", Some("1d"));

        let report = IngestService::fetch_and_ingest(&state, &request).await.unwrap();
        assert_eq!(report.status, IngestStatus::Created);
        assert_eq!(store.read_all("TSLA").unwrap().len(), 1);
        assert_eq!(source.requests.lock().len(), 1);

        // Upstream failures surface unchanged and write nothing
        let err = IngestService::fetch_and_ingest(&state, &request).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
        assert_eq!(store.metadata_log("TSLA").len(), 1);
    }

    /// Memory store whose table writes are slow and count overlapping writers
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl SlowStore {
        fn slow_write<T>(&self, write: impl FnOnce() -> T) -> T {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            let result = write();
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl TableStore for SlowStore {
        fn exists(&self, symbol: &str) -> Result<bool> {
            self.inner.exists(symbol)
        }

        fn read_all(&self, symbol: &str) -> Result<Vec<Row>> {
            self.inner.read_all(symbol)
        }

        fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()> {
            self.slow_write(|| self.inner.write_all(symbol, rows))
        }

        fn append(&self, symbol: &str, rows: &[Row]) -> Result<()> {
            self.slow_write(|| self.inner.append(symbol, rows))
        }
    }

    impl CheckpointStore for SlowStore {
        fn read(&self, symbol: &str) -> Result<Option<Checkpoint>> {
            self.inner.read(symbol)
        }

        fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
            self.inner.write(checkpoint)
        }

        fn clear(&self, symbol: &str) -> Result<()> {
            self.inner.clear(symbol)
        }
    }

    impl MetadataStore for SlowStore {
        fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()> {
            self.inner.append_metadata(symbol, record)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_ingest_keeps_symbol_locked_until_write_ends() {
        let store = Arc::new(SlowStore::default());
        let storage = Storage::from_store(store.clone(), StorageBackend::Memory);
        let state = Arc::new(AppState::with_parts(
            AppConfig::default(),
            storage,
            Arc::new(StubSource::default()),
        ));

        let first = {
            let state = state.clone();
            tokio::spawn(async move {
                IngestService::ingest_batch(&state, "TSLA", batch(&["2024-01-02 14:30:00"])).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Same as a client disconnect: the handler future is dropped mid-write
        first.abort();
        let _ = first.await;

        let second = IngestService::ingest_batch(
            &state,
            "TSLA",
            batch(&["2024-01-02 14:30:00", "2024-01-02 14:31:00"]),
        )
        .await
        .unwrap();

        assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
        // The second run saw the first run's committed table
        assert_eq!(second.status, IngestStatus::Appended);
        assert_eq!(second.rows_added, 1);
        assert_eq!(store.inner.read_all("TSLA").unwrap().len(), 2);
    }
}
