//! DuckDB migrations

use crate::error::Result;
use duckdb::Connection;

/// Run all DuckDB migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Migration names are the primary key; there is nothing to auto-increment
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            name VARCHAR PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )?;

    run_migration(conn, "001_market_data", CREATE_MARKET_DATA)?;
    run_migration(conn, "002_ohlcv_tables", CREATE_OHLCV_TABLES)?;
    run_migration(conn, "003_data_catalog", CREATE_DATA_CATALOG)?;
    run_migration(conn, "004_symbol_metadata_log", CREATE_SYMBOL_METADATA_LOG)?;

    tracing::info!("DuckDB migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM migrations WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running DuckDB migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

// Uniqueness per (symbol, ts) is enforced by the ingestion engine, not by a
// key: a replaced table deletes and re-inserts the same timestamps in one
// transaction.
const CREATE_MARKET_DATA: &str = r#"
CREATE TABLE IF NOT EXISTS market_data (
    symbol VARCHAR NOT NULL,
    ts BIGINT NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_market_data_symbol_ts ON market_data(symbol, ts);
"#;

const CREATE_OHLCV_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS ohlcv_tables (
    symbol VARCHAR PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

const CREATE_DATA_CATALOG: &str = r#"
CREATE TABLE IF NOT EXISTS data_catalog (
    symbol VARCHAR PRIMARY KEY,
    range_start BIGINT NOT NULL,
    range_end BIGINT NOT NULL,
    last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

const CREATE_SYMBOL_METADATA_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_metadata_log (
    symbol VARCHAR NOT NULL,
    ingested_at BIGINT NOT NULL,
    payload VARCHAR NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_symbol_metadata_log_symbol ON symbol_metadata_log(symbol);
"#;
