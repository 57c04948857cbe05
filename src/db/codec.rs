//! CSV encoding shared by the file and object-store backends

use super::models::{MetadataRecord, Row, TABLE_HEADER};
use crate::error::{AppError, Result};
use tracing::warn;

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| AppError::Io(e.into_error()))
}

/// Rows as CSV lines, optionally preceded by the table header
pub fn encode_rows(rows: &[Row], header: bool) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if header {
        writer.write_record(TABLE_HEADER)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    into_bytes(writer)
}

/// Parse a stored table. Empty content is an empty table; anything else
/// that does not match the header or the row shape is `CorruptTable`.
pub fn decode_rows(symbol: &str, bytes: &[u8]) -> Result<Vec<Row>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| AppError::corrupt_table(symbol, e))?
        .clone();
    if headers.iter().ne(TABLE_HEADER.iter().copied()) {
        return Err(AppError::corrupt_table(
            symbol,
            format!("unexpected header {:?}", headers),
        ));
    }

    reader
        .deserialize::<Row>()
        .enumerate()
        .map(|(index, record)| {
            record.map_err(|e| AppError::corrupt_table(symbol, format!("row {}: {}", index + 1, e)))
        })
        .collect()
}

/// Bytes to add after `existing` so the result ends in a complete line.
/// A last line edited without its newline gets one first.
pub fn line_break_before_append(existing: &[u8]) -> &'static [u8] {
    match existing.last() {
        Some(b'\n') | None => b"",
        Some(_) => b"\n",
    }
}

/// Extend a table's content with `rows`; empty content gets the header first
pub fn append_rows(existing: &mut Vec<u8>, rows: &[Row]) -> Result<()> {
    let encoded = encode_rows(rows, existing.is_empty())?;
    let line_break = line_break_before_append(existing);
    existing.extend_from_slice(line_break);
    existing.extend_from_slice(&encoded);
    Ok(())
}

/// Header of an existing metadata log, `None` when the log is empty
pub fn metadata_header(bytes: &[u8]) -> Result<Option<Vec<String>>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_reader(bytes);
    let header = reader.headers()?.iter().map(String::from).collect();
    Ok(Some(header))
}

/// One metadata log line aligned to `existing_header`, or a new header plus
/// the line when the log is empty. `label` names the log in warnings.
pub fn encode_metadata(
    existing_header: Option<Vec<String>>,
    record: &MetadataRecord,
    label: &str,
) -> Result<Vec<u8>> {
    let (header, write_header) = match existing_header {
        Some(header) => {
            let dropped = record.unmapped_fields(&header);
            if !dropped.is_empty() {
                warn!(
                    "Metadata log {} has no column for {:?}; values dropped",
                    label, dropped
                );
            }
            (header, false)
        }
        None => (record.columns(), true),
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if write_header {
        writer.write_record(&header)?;
    }
    writer.write_record(record.values_for(&header))?;
    into_bytes(writer)
}
