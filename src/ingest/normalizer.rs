//! Batch normalizer
//!
//! Turns a raw fetched batch into canonical rows: timestamps parsed as UTC
//! with second precision, OHLCV fields typed, rows sorted ascending with at
//! most one row per timestamp. The metadata mapping passes through untouched.

use crate::db::models::{parse_timestamp, Row};
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// One row as delivered by the upstream source, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default, alias = "datetime", alias = "date")]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub open: Option<Value>,
    #[serde(default)]
    pub high: Option<Value>,
    #[serde(default)]
    pub low: Option<Value>,
    #[serde(default)]
    pub close: Option<Value>,
    #[serde(default)]
    pub volume: Option<Value>,
}

/// One fetch result: rows plus descriptive metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, alias = "data_evolution")]
    pub rows: Vec<RawRow>,
}

/// Field holding the rows in a flat payload
const FLAT_ROWS_KEY: &str = "data_evolution";

impl RawBatch {
    /// Accept either `{"metadata": {...}, "rows": [...]}` or the flat shape
    /// where metadata fields sit next to a `data_evolution` row array.
    pub fn from_payload(payload: Value) -> Result<Self> {
        let Value::Object(mut map) = payload else {
            return Err(AppError::MalformedBatch("batch must be a JSON object".to_string()));
        };

        let is_structured = map.contains_key("rows")
            && map.keys().all(|k| k == "rows" || k == "metadata");
        if is_structured {
            return serde_json::from_value(Value::Object(map))
                .map_err(|e| AppError::MalformedBatch(e.to_string()));
        }

        let rows = match map.remove(FLAT_ROWS_KEY) {
            Some(rows) => serde_json::from_value::<Vec<RawRow>>(rows)
                .map_err(|e| AppError::MalformedBatch(format!("{}: {}", FLAT_ROWS_KEY, e)))?,
            None => {
                return Err(AppError::MalformedBatch(format!(
                    "batch has neither 'rows' nor '{}'",
                    FLAT_ROWS_KEY
                )))
            }
        };

        Ok(Self {
            metadata: map.into_iter().collect(),
            rows,
        })
    }
}

/// Canonical batch handed to the reconciliation engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedBatch {
    pub rows: Vec<Row>,
    pub metadata: BTreeMap<String, Value>,
}

/// Parse every row; fail on the first one that cannot be used
pub fn normalize(batch: RawBatch) -> Result<NormalizedBatch> {
    let RawBatch { metadata, rows } = batch;
    let received = rows.len();

    let parsed = rows
        .iter()
        .enumerate()
        .map(|(index, raw)| normalize_row(index, raw))
        .collect::<Result<Vec<_>>>()?;
    let canonical = into_canonical_order(parsed);

    if canonical.len() != received {
        debug!(
            "Collapsed {} duplicate timestamps in batch",
            received - canonical.len()
        );
    }

    Ok(NormalizedBatch {
        rows: canonical,
        metadata,
    })
}

/// Sort ascending by timestamp, keeping the last row for a repeated timestamp
pub fn into_canonical_order(mut rows: Vec<Row>) -> Vec<Row> {
    // Stable sort keeps arrival order among equal timestamps
    rows.sort_by_key(|row| row.timestamp);
    let mut canonical: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        match canonical.last_mut() {
            Some(last) if last.timestamp == row.timestamp => *last = row,
            _ => canonical.push(row),
        }
    }
    canonical
}

fn normalize_row(index: usize, raw: &RawRow) -> Result<Row> {
    let field = |name: &str, value: &Option<Value>| -> Result<Value> {
        match value {
            Some(Value::Null) | None => Err(AppError::MalformedBatch(format!(
                "row {}: missing {}",
                index, name
            ))),
            Some(v) => Ok(v.clone()),
        }
    };

    let ts_value = field("timestamp", &raw.timestamp)?;
    let timestamp = parse_raw_timestamp(&ts_value).ok_or_else(|| {
        AppError::MalformedBatch(format!("row {}: unparseable timestamp {}", index, ts_value))
    })?;

    let price = |name: &str, value: &Option<Value>| -> Result<f64> {
        let v = field(name, value)?;
        parse_price(&v).ok_or_else(|| {
            AppError::MalformedBatch(format!("row {}: invalid {} {}", index, name, v))
        })
    };

    let open = price("open", &raw.open)?;
    let high = price("high", &raw.high)?;
    let low = price("low", &raw.low)?;
    let close = price("close", &raw.close)?;

    let volume_value = field("volume", &raw.volume)?;
    let volume = parse_volume(&volume_value).ok_or_else(|| {
        AppError::MalformedBatch(format!("row {}: invalid volume {}", index, volume_value))
    })?;

    Ok(Row::new(timestamp, open, high, low, close, volume))
}

fn parse_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_opt(secs.floor() as i64, 0).single()
}

/// Textual or numeric timestamp -> UTC, second precision
pub fn parse_raw_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let ts = match value {
        Value::Number(n) => match n.as_i64() {
            Some(secs) => Utc.timestamp_opt(secs, 0).single(),
            None => parse_epoch(n.as_f64()?),
        },
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }?;
    Some(ts.trunc_subsecs(0))
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ts) = parse_timestamp(s) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    if let Ok(secs) = s.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    s.parse::<f64>().ok().and_then(parse_epoch)
}

fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    price.is_finite().then_some(price)
}

fn parse_volume(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            let v = n.as_f64()?;
            (v.is_finite() && v.abs() < i64::MAX as f64).then(|| v.trunc() as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                let v = s.parse::<f64>().ok()?;
                (v.is_finite() && v.abs() < i64::MAX as f64).then(|| v.trunc() as i64)
            })
        }
        _ => None,
    }
}
