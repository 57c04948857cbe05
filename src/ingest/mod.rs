//! Incremental ingestion: normalize a batch, merge it, log its metadata

pub mod metadata;
pub mod normalizer;
pub mod reconcile;

pub use metadata::append_snapshot;
pub use normalizer::{normalize, NormalizedBatch, RawBatch, RawRow};
pub use reconcile::{
    reconcile, resolve_range, select_new_rows, IngestStatus, RangeResolution, RangeSource,
    ReconcileOutcome,
};
