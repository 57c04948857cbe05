//! DuckDB backend for historical data (Historify)

mod migrations;

use super::models::{Checkpoint, MetadataRecord, Row};
use super::{validate_symbol, CheckpointStore, MetadataStore, TableStore};
use crate::error::{AppError, Result};
use chrono::{DateTime, TimeZone, Utc};
use duckdb::Connection;
use parking_lot::Mutex;
use std::path::Path;

/// DuckDB database wrapper
pub struct DuckDb {
    conn: Mutex<Connection>,
}

fn from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

impl DuckDb {
    /// Create new DuckDB connection
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Transient database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    fn insert_rows(conn: &Connection, symbol: &str, rows: &[Row]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO market_data (symbol, ts, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )?;

        for row in rows {
            stmt.execute(duckdb::params![
                symbol,
                row.timestamp.timestamp(),
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
            ])?;
        }

        Ok(())
    }

    /// Replace (or with `replace = false`, extend) a symbol's rows atomically
    fn store_rows(&self, symbol: &str, rows: &[Row], replace: bool) -> Result<()> {
        let mut conn = self.conn.lock();

        let tx = conn.transaction()?;
        if replace {
            tx.execute("DELETE FROM market_data WHERE symbol = ?", [symbol])?;
        }
        Self::insert_rows(&tx, symbol, rows)?;
        tx.execute(
            "INSERT INTO ohlcv_tables (symbol) VALUES (?) ON CONFLICT DO NOTHING",
            [symbol],
        )?;
        tx.commit()?;

        Ok(())
    }
}

impl TableStore for DuckDb {
    fn exists(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM ohlcv_tables WHERE symbol = ?",
            [symbol],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn read_all(&self, symbol: &str) -> Result<Vec<Row>> {
        validate_symbol(symbol)?;
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                "SELECT ts, open, high, low, close, volume
                 FROM market_data
                 WHERE symbol = ?
                 ORDER BY ts ASC",
            )
            .map_err(|e| AppError::corrupt_table(symbol, e))?;

        let raw = stmt
            .query_map([symbol], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| AppError::corrupt_table(symbol, e))?;

        raw.into_iter()
            .map(|(ts, open, high, low, close, volume)| {
                let timestamp = from_epoch(ts).ok_or_else(|| {
                    AppError::corrupt_table(symbol, format!("timestamp {} out of range", ts))
                })?;
                Ok(Row::new(timestamp, open, high, low, close, volume))
            })
            .collect()
    }

    fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        self.store_rows(symbol, rows, true)
            .map_err(|e| AppError::storage_write(&format!("write market_data {}", symbol), e))
    }

    fn append(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        self.store_rows(symbol, rows, false)
            .map_err(|e| AppError::storage_write(&format!("append market_data {}", symbol), e))
    }
}

impl CheckpointStore for DuckDb {
    fn read(&self, symbol: &str) -> Result<Option<Checkpoint>> {
        validate_symbol(symbol)?;
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT range_start, range_end FROM data_catalog WHERE symbol = ?")
            .map_err(|e| AppError::checkpoint_unavailable(symbol, e))?;
        let found = stmt
            .query_map([symbol], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| AppError::checkpoint_unavailable(symbol, e))?;

        let Some((start, end)) = found.into_iter().next() else {
            return Ok(None);
        };

        let range_start = from_epoch(start)
            .ok_or_else(|| AppError::checkpoint_unavailable(symbol, "range_start out of range"))?;
        let range_end = from_epoch(end)
            .ok_or_else(|| AppError::checkpoint_unavailable(symbol, "range_end out of range"))?;

        Checkpoint::new(symbol, range_start, range_end)
            .map(Some)
            .map_err(|e| AppError::checkpoint_unavailable(symbol, e))
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_symbol(&checkpoint.symbol)?;
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO data_catalog (symbol, range_start, range_end)
             VALUES (?, ?, ?)
             ON CONFLICT (symbol) DO UPDATE SET
               range_start = excluded.range_start,
               range_end = excluded.range_end,
               last_updated = get_current_timestamp()",
            duckdb::params![
                checkpoint.symbol,
                checkpoint.range_start.timestamp(),
                checkpoint.range_end.timestamp(),
            ],
        )
        .map_err(|e| {
            AppError::storage_write(&format!("write data_catalog {}", checkpoint.symbol), e)
        })?;

        Ok(())
    }

    fn clear(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM data_catalog WHERE symbol = ?", [symbol])
            .map_err(|e| AppError::storage_write(&format!("clear data_catalog {}", symbol), e))?;
        Ok(())
    }
}

impl MetadataStore for DuckDb {
    fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()> {
        validate_symbol(symbol)?;
        let payload = serde_json::to_string(&record.fields)?;
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO symbol_metadata_log (symbol, ingested_at, payload) VALUES (?, ?, ?)",
            duckdb::params![symbol, record.ingested_at.timestamp(), payload],
        )
        .map_err(|e| AppError::storage_write(&format!("append metadata {}", symbol), e))?;

        Ok(())
    }
}
