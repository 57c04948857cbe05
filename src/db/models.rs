//! Storage data models

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Textual timestamp encoding used by tables and checkpoints
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column names of a stored table, in order
pub const TABLE_HEADER: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// First column of every metadata log row
pub const METADATA_TIMESTAMP_COLUMN: &str = "timestamp";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse the fixed `YYYY-MM-DD HH:MM:SS` encoding as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Serde adapter for `DateTime<Utc>` <-> `YYYY-MM-DD HH:MM:SS`
pub mod ts_format {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(with = "ts_format")]
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Row {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
    ) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Known time span of a symbol's table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub symbol: String,
    #[serde(with = "ts_format")]
    pub range_start: DateTime<Utc>,
    #[serde(with = "ts_format")]
    pub range_end: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(symbol: &str, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> Result<Self> {
        if range_start > range_end {
            return Err(AppError::Validation(format!(
                "checkpoint for {} starts after it ends ({} > {})",
                symbol,
                format_timestamp(&range_start),
                format_timestamp(&range_end)
            )));
        }

        Ok(Self {
            symbol: symbol.to_string(),
            range_start: range_start.trunc_subsecs(0),
            range_end: range_end.trunc_subsecs(0),
        })
    }

    /// Span covering `rows`, `None` when there are none
    pub fn from_rows(symbol: &str, rows: &[Row]) -> Option<Self> {
        let start = rows.iter().map(|r| r.timestamp).min()?;
        let end = rows.iter().map(|r| r.timestamp).max()?;
        Some(Self {
            symbol: symbol.to_string(),
            range_start: start,
            range_end: end,
        })
    }

    /// Span widened to also cover `rows`
    pub fn extended_with(&self, rows: &[Row]) -> Self {
        match Checkpoint::from_rows(&self.symbol, rows) {
            Some(other) => Self {
                symbol: self.symbol.clone(),
                range_start: self.range_start.min(other.range_start),
                range_end: self.range_end.max(other.range_end),
            },
            None => self.clone(),
        }
    }

    pub fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            start_timestamp: self.range_start,
            last_timestamp: self.range_end,
        }
    }
}

/// Persisted checkpoint payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(with = "ts_format")]
    pub start_timestamp: DateTime<Utc>,
    #[serde(with = "ts_format")]
    pub last_timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Decode a JSON payload; any failure means the checkpoint is unavailable
    pub fn from_json(symbol: &str, payload: &[u8]) -> Result<Checkpoint> {
        let record: CheckpointRecord = serde_json::from_slice(payload)
            .map_err(|e| AppError::checkpoint_unavailable(symbol, e))?;
        record.into_checkpoint(symbol)
    }

    pub fn into_checkpoint(self, symbol: &str) -> Result<Checkpoint> {
        Checkpoint::new(symbol, self.start_timestamp, self.last_timestamp)
            .map_err(|e| AppError::checkpoint_unavailable(symbol, e))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Snapshot of batch-level descriptive fields taken at ingestion time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub ingested_at: DateTime<Utc>,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl MetadataRecord {
    pub fn new(ingested_at: DateTime<Utc>, fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self { ingested_at, fields }
    }

    /// Header used when this record starts a new log
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(METADATA_TIMESTAMP_COLUMN.to_string())
            .chain(
                self.fields
                    .keys()
                    .filter(|k| k.as_str() != METADATA_TIMESTAMP_COLUMN)
                    .cloned(),
            )
            .collect()
    }

    /// Cell values aligned to `header`; unknown columns stay empty
    pub fn values_for(&self, header: &[String]) -> Vec<String> {
        header
            .iter()
            .map(|column| {
                if column == METADATA_TIMESTAMP_COLUMN {
                    self.ingested_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                } else {
                    self.fields.get(column).map(cell_text).unwrap_or_default()
                }
            })
            .collect()
    }

    /// Fields that `header` has no column for
    pub fn unmapped_fields<'a>(&'a self, header: &'a [String]) -> Vec<&'a str> {
        self.fields
            .keys()
            .filter(|k| k.as_str() != METADATA_TIMESTAMP_COLUMN && !header.contains(k))
            .map(|k| k.as_str())
            .collect()
    }
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn row(s: &str) -> Row {
        Row::new(ts(s), 1.0, 2.0, 0.5, 1.5, 100)
    }

    #[test]
    fn test_timestamp_round_trip() {
        let original = "2024-03-01 14:30:59";
        assert_eq!(format_timestamp(&ts(original)), original);
        assert!(parse_timestamp("2024-03-01T14:30:59Z").is_none());
        assert!(parse_timestamp("2024-03-01 14:30").is_none());
    }

    #[test]
    fn test_row_truncates_subseconds() {
        let precise = Utc.timestamp_opt(1_700_000_000, 750_000_000).unwrap();
        let row = Row::new(precise, 1.0, 1.0, 1.0, 1.0, 1);
        assert_eq!(row.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(row.timestamp.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_checkpoint_rejects_inverted_range() {
        let result = Checkpoint::new("TSLA", ts("2024-01-02 00:00:00"), ts("2024-01-01 00:00:00"));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_checkpoint_from_rows_and_extend() {
        let rows = vec![row("2024-01-01 10:02:00"), row("2024-01-01 10:00:00")];
        let cp = Checkpoint::from_rows("TSLA", &rows).unwrap();
        assert_eq!(cp.range_start, ts("2024-01-01 10:00:00"));
        assert_eq!(cp.range_end, ts("2024-01-01 10:02:00"));

        let wider = cp.extended_with(&[row("2024-01-01 10:05:00")]);
        assert_eq!(wider.range_start, ts("2024-01-01 10:00:00"));
        assert_eq!(wider.range_end, ts("2024-01-01 10:05:00"));
        assert_eq!(cp.extended_with(&[]), cp);

        assert!(Checkpoint::from_rows("TSLA", &[]).is_none());
    }

    #[test]
    fn test_checkpoint_record_json() {
        let cp = Checkpoint::new("TSLA", ts("2024-01-01 10:00:00"), ts("2024-01-01 10:02:00")).unwrap();
        let payload = cp.to_record().to_json().unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(text.contains("\"start_timestamp\": \"2024-01-01 10:00:00\""));
        assert!(text.contains("\"last_timestamp\": \"2024-01-01 10:02:00\""));

        assert_eq!(CheckpointRecord::from_json("TSLA", &payload).unwrap(), cp);
    }

    #[test]
    fn test_checkpoint_record_rejects_bad_payloads() {
        let cases: [&[u8]; 4] = [
            br#"{"last_timestamp": "2024-01-01 10:00:00"}"#,
            br#"{"start_timestamp": "2024-01-01", "last_timestamp": "2024-01-01 10:00:00"}"#,
            br#"{"start_timestamp": "2024-01-01 10:00:00", "last_ti"#,
            br#"{"start_timestamp": "2024-01-02 00:00:00", "last_timestamp": "2024-01-01 00:00:00"}"#,
        ];
        for payload in cases {
            let result = CheckpointRecord::from_json("TSLA", payload);
            assert!(
                matches!(result, Err(AppError::CheckpointUnavailable { .. })),
                "payload {:?} should be unavailable",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_metadata_alignment() {
        let mut fields = BTreeMap::new();
        fields.insert("shortName".to_string(), json!("Tesla, Inc."));
        fields.insert("regularMarketPrice".to_string(), json!(251.5));
        fields.insert("beta".to_string(), serde_json::Value::Null);
        let record = MetadataRecord::new(ts("2024-01-01 10:00:00"), fields);

        let columns = record.columns();
        assert_eq!(columns[0], "timestamp");
        assert_eq!(columns.len(), 4);

        let header = vec![
            "timestamp".to_string(),
            "shortName".to_string(),
            "exchange".to_string(),
            "beta".to_string(),
        ];
        let values = record.values_for(&header);
        assert_eq!(values, vec!["2024-01-01T10:00:00Z", "Tesla, Inc.", "", ""]);
        assert_eq!(record.unmapped_fields(&header), vec!["regularMarketPrice"]);
    }
}
