//! Metadata appender

use crate::db::models::MetadataRecord;
use crate::db::MetadataStore;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Append one snapshot of the batch metadata to the symbol's log.
///
/// Runs after rows and checkpoint are committed; callers report a failure
/// here without undoing anything.
pub fn append_snapshot(
    store: &dyn MetadataStore,
    symbol: &str,
    metadata: &BTreeMap<String, Value>,
    ingested_at: DateTime<Utc>,
) -> Result<MetadataRecord> {
    let record = MetadataRecord::new(ingested_at, metadata.clone());
    store.append_metadata(symbol, &record)?;
    debug!(
        "Recorded metadata snapshot for {} ({} fields)",
        symbol,
        record.fields.len()
    );
    Ok(record)
}
