//! In-memory store used by tests and the `memory` backend

use super::models::{Checkpoint, MetadataRecord, Row};
use super::{CheckpointStore, MetadataStore, TableStore};
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stored checkpoint slot; `Garbled` models a checkpoint that no longer parses
#[derive(Debug, Clone)]
enum CheckpointSlot {
    Valid(Checkpoint),
    Garbled(String),
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    corrupt_tables: Mutex<HashMap<String, String>>,
    checkpoints: Mutex<HashMap<String, CheckpointSlot>>,
    metadata: Mutex<HashMap<String, Vec<MetadataRecord>>>,
    fail_table_writes: AtomicBool,
    fail_checkpoint_writes: AtomicBool,
    fail_metadata_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every table write fail with `StorageWrite`
    pub fn set_fail_table_writes(&self, fail: bool) {
        self.fail_table_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_checkpoint_writes(&self, fail: bool) {
        self.fail_checkpoint_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_metadata_writes(&self, fail: bool) {
        self.fail_metadata_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace a checkpoint with content that fails to parse
    pub fn garble_checkpoint(&self, symbol: &str, reason: &str) {
        self.checkpoints
            .lock()
            .insert(symbol.to_string(), CheckpointSlot::Garbled(reason.to_string()));
    }

    /// Make the table unreadable
    pub fn corrupt_table(&self, symbol: &str, reason: &str) {
        self.tables.lock().entry(symbol.to_string()).or_default();
        self.corrupt_tables
            .lock()
            .insert(symbol.to_string(), reason.to_string());
    }

    /// Create a header-only table
    pub fn create_empty_table(&self, symbol: &str) {
        self.tables.lock().insert(symbol.to_string(), Vec::new());
    }

    pub fn metadata_log(&self, symbol: &str) -> Vec<MetadataRecord> {
        self.metadata.lock().get(symbol).cloned().unwrap_or_default()
    }

    fn check(&self, flag: &AtomicBool, what: &str, symbol: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(AppError::storage_write(
                &format!("{} {}", what, symbol),
                "injected failure",
            ));
        }
        Ok(())
    }
}

impl TableStore for MemoryStore {
    fn exists(&self, symbol: &str) -> Result<bool> {
        Ok(self.tables.lock().contains_key(symbol))
    }

    fn read_all(&self, symbol: &str) -> Result<Vec<Row>> {
        if let Some(reason) = self.corrupt_tables.lock().get(symbol) {
            return Err(AppError::corrupt_table(symbol, reason));
        }
        self.tables
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("table for {}", symbol)))
    }

    fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        self.check(&self.fail_table_writes, "write table", symbol)?;
        self.corrupt_tables.lock().remove(symbol);
        self.tables.lock().insert(symbol.to_string(), rows.to_vec());
        Ok(())
    }

    fn append(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        self.check(&self.fail_table_writes, "append table", symbol)?;
        self.tables
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }
}

impl CheckpointStore for MemoryStore {
    fn read(&self, symbol: &str) -> Result<Option<Checkpoint>> {
        match self.checkpoints.lock().get(symbol) {
            None => Ok(None),
            Some(CheckpointSlot::Valid(cp)) => Ok(Some(cp.clone())),
            Some(CheckpointSlot::Garbled(reason)) => {
                Err(AppError::checkpoint_unavailable(symbol, reason))
            }
        }
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check(&self.fail_checkpoint_writes, "write checkpoint", &checkpoint.symbol)?;
        self.checkpoints.lock().insert(
            checkpoint.symbol.clone(),
            CheckpointSlot::Valid(checkpoint.clone()),
        );
        Ok(())
    }

    fn clear(&self, symbol: &str) -> Result<()> {
        self.checkpoints.lock().remove(symbol);
        Ok(())
    }
}

impl MetadataStore for MemoryStore {
    fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()> {
        self.check(&self.fail_metadata_writes, "append metadata", symbol)?;
        self.metadata
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::parse_timestamp;

    fn row(s: &str) -> Row {
        Row::new(parse_timestamp(s).unwrap(), 1.0, 1.0, 1.0, 1.0, 1)
    }

    #[test]
    fn test_table_lifecycle() {
        let store = MemoryStore::new();
        assert!(!store.exists("TSLA").unwrap());
        assert!(matches!(store.read_all("TSLA"), Err(AppError::NotFound(_))));

        store.write_all("TSLA", &[row("2024-01-01 00:00:00")]).unwrap();
        store.append("TSLA", &[row("2024-01-01 00:01:00")]).unwrap();
        assert!(store.exists("TSLA").unwrap());
        assert_eq!(store.read_all("TSLA").unwrap().len(), 2);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        store.set_fail_table_writes(true);
        let err = store.write_all("TSLA", &[]).unwrap_err();
        assert!(matches!(err, AppError::StorageWrite(_)));
        assert!(!store.exists("TSLA").unwrap());
    }

    #[test]
    fn test_garbled_checkpoint() {
        let store = MemoryStore::new();
        store.garble_checkpoint("TSLA", "truncated");
        assert!(matches!(
            store.read("TSLA"),
            Err(AppError::CheckpointUnavailable { .. })
        ));
        store.clear("TSLA").unwrap();
        assert!(store.read("TSLA").unwrap().is_none());
    }
}
