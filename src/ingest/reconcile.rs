//! Reconciliation engine
//!
//! Merges a normalized batch into a symbol's stored table. A missing table
//! (or one holding only a header) is created from the whole batch; an existing
//! table only receives rows strictly newer than its known range end. The table
//! is always written before the checkpoint, so a checkpoint never describes
//! rows that were not committed.

use super::normalizer::into_canonical_order;
use crate::db::models::{format_timestamp, Checkpoint, Row};
use crate::db::{CheckpointStore, TableStore};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Where the current range of an existing table came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeResolution {
    CheckpointFound(Checkpoint),
    /// Checkpoint missing or unusable; span rebuilt from the table's rows
    CheckpointRecoveredFromTable(Checkpoint),
    /// Table holds no rows and there is no checkpoint
    TableEmpty,
}

impl RangeResolution {
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            RangeResolution::CheckpointFound(cp)
            | RangeResolution::CheckpointRecoveredFromTable(cp) => Some(cp),
            RangeResolution::TableEmpty => None,
        }
    }

    pub fn source(&self) -> RangeSource {
        match self {
            RangeResolution::CheckpointFound(_) => RangeSource::Checkpoint,
            RangeResolution::CheckpointRecoveredFromTable(_) => RangeSource::RecoveredFromTable,
            RangeResolution::TableEmpty => RangeSource::TableEmpty,
        }
    }
}

/// Serializable tag of the range origin, reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSource {
    /// No table existed before this run
    NewTable,
    Checkpoint,
    RecoveredFromTable,
    TableEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    Appended,
    UpToDate,
}

/// Result of merging one batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub status: IngestStatus,
    pub rows_added: usize,
    pub checkpoint: Option<Checkpoint>,
    pub range_source: RangeSource,
}

impl ReconcileOutcome {
    fn up_to_date(checkpoint: Option<Checkpoint>, range_source: RangeSource) -> Self {
        Self {
            status: IngestStatus::UpToDate,
            rows_added: 0,
            checkpoint,
            range_source,
        }
    }
}

/// Determine the known span of an existing table.
///
/// Checkpoint problems are never fatal: they fall back to scanning the table.
/// A table that cannot be read is `CorruptTable`.
pub fn resolve_range(
    tables: &dyn TableStore,
    checkpoints: &dyn CheckpointStore,
    symbol: &str,
) -> Result<RangeResolution> {
    match checkpoints.read(symbol) {
        Ok(Some(checkpoint)) => {
            debug!(
                "Checkpoint for {}: {} .. {}",
                symbol,
                format_timestamp(&checkpoint.range_start),
                format_timestamp(&checkpoint.range_end)
            );
            return Ok(RangeResolution::CheckpointFound(checkpoint));
        }
        Ok(None) => {
            warn!("No checkpoint for {}, recovering range from table", symbol);
        }
        Err(e) => {
            warn!("{}; recovering range from table", e);
        }
    }

    let rows = tables.read_all(symbol).map_err(|e| match e {
        AppError::CorruptTable { .. } => e,
        other => AppError::corrupt_table(symbol, other),
    })?;

    match Checkpoint::from_rows(symbol, &rows) {
        Some(checkpoint) => {
            info!(
                "Recovered range for {} from {} stored rows: {} .. {}",
                symbol,
                rows.len(),
                format_timestamp(&checkpoint.range_start),
                format_timestamp(&checkpoint.range_end)
            );
            Ok(RangeResolution::CheckpointRecoveredFromTable(checkpoint))
        }
        None => Ok(RangeResolution::TableEmpty),
    }
}

/// Rows strictly newer than `range_end`, ascending
pub fn select_new_rows(rows: &[Row], range_end: DateTime<Utc>) -> Vec<Row> {
    let selected = rows
        .iter()
        .filter(|row| row.timestamp > range_end)
        .copied()
        .collect();
    into_canonical_order(selected)
}

/// Merge `rows` into the symbol's table and advance its checkpoint
pub fn reconcile(
    tables: &dyn TableStore,
    checkpoints: &dyn CheckpointStore,
    symbol: &str,
    rows: &[Row],
) -> Result<ReconcileOutcome> {
    if !tables.exists(symbol)? {
        info!("No table for {}, creating it from the batch", symbol);
        return create_table(tables, checkpoints, symbol, rows, RangeSource::NewTable);
    }

    let resolution = resolve_range(tables, checkpoints, symbol)?;
    let source = resolution.source();
    let current = match resolution {
        RangeResolution::TableEmpty => {
            info!("Table for {} is empty, rewriting it from the batch", symbol);
            return create_table(tables, checkpoints, symbol, rows, source);
        }
        RangeResolution::CheckpointFound(cp) | RangeResolution::CheckpointRecoveredFromTable(cp) => cp,
    };

    let new_rows = select_new_rows(rows, current.range_end);
    if new_rows.is_empty() {
        // Rows older than range_start cannot be placed without rewriting
        if rows.iter().any(|row| row.timestamp < current.range_start) {
            warn!(
                "Discarded rows for {} older than {} (backfill is not supported)",
                symbol,
                format_timestamp(&current.range_start)
            );
        }
        info!(
            "{} is up to date through {}",
            symbol,
            format_timestamp(&current.range_end)
        );
        return Ok(ReconcileOutcome::up_to_date(Some(current), source));
    }

    debug!(
        "Selected {} of {} rows for {} after {}",
        new_rows.len(),
        rows.len(),
        symbol,
        format_timestamp(&current.range_end)
    );

    tables.append(symbol, &new_rows)?;
    let updated = current.extended_with(&new_rows);
    commit_checkpoint(checkpoints, &updated)?;

    info!(
        "Appended {} rows to {}, range now {} .. {}",
        new_rows.len(),
        symbol,
        format_timestamp(&updated.range_start),
        format_timestamp(&updated.range_end)
    );

    Ok(ReconcileOutcome {
        status: IngestStatus::Appended,
        rows_added: new_rows.len(),
        checkpoint: Some(updated),
        range_source: source,
    })
}

fn create_table(
    tables: &dyn TableStore,
    checkpoints: &dyn CheckpointStore,
    symbol: &str,
    rows: &[Row],
    source: RangeSource,
) -> Result<ReconcileOutcome> {
    let sorted = into_canonical_order(rows.to_vec());
    let Some(checkpoint) = Checkpoint::from_rows(symbol, &sorted) else {
        info!("Empty batch for {}, nothing to store", symbol);
        return Ok(ReconcileOutcome::up_to_date(None, source));
    };

    tables.write_all(symbol, &sorted)?;
    commit_checkpoint(checkpoints, &checkpoint)?;

    info!(
        "Created table for {} with {} rows ({} .. {})",
        symbol,
        sorted.len(),
        format_timestamp(&checkpoint.range_start),
        format_timestamp(&checkpoint.range_end)
    );

    Ok(ReconcileOutcome {
        status: IngestStatus::Created,
        rows_added: sorted.len(),
        checkpoint: Some(checkpoint),
        range_source: source,
    })
}

/// Write the checkpoint for rows that are already committed.
/// On failure the old checkpoint is stale, so it is removed.
fn commit_checkpoint(checkpoints: &dyn CheckpointStore, checkpoint: &Checkpoint) -> Result<()> {
    if let Err(e) = checkpoints.write(checkpoint) {
        error!(
            "Checkpoint write for {} failed after table commit: {}",
            checkpoint.symbol, e
        );
        if let Err(clear_err) = checkpoints.clear(&checkpoint.symbol) {
            error!(
                "Failed to clear stale checkpoint for {}: {}",
                checkpoint.symbol, clear_err
            );
        }
        return Err(e);
    }
    Ok(())
}
