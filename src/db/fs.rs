//! Filesystem backend
//!
//! Layout under the data directory:
//!
//! ```text
//! fetch/{SYMBOL}_evolution.csv        OHLCV table, header + one line per bar
//! fetch/{SYMBOL}_metadata.csv         metadata snapshot log
//! checkpoint/{SYMBOL}_checkpoint.json {"start_timestamp", "last_timestamp"}
//! ```
//!
//! Whole-file writes go through a sibling temp file and a rename so a failed
//! write never leaves a half-written table or checkpoint behind. A failed
//! append is cut back to the file's previous length.

use super::codec::{decode_rows, encode_metadata, encode_rows, metadata_header};
use super::models::{Checkpoint, CheckpointRecord, MetadataRecord, Row};
use super::{validate_symbol, CheckpointStore, MetadataStore, TableStore};
use crate::error::{AppError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TABLE_DIR: &str = "fetch";
const CHECKPOINT_DIR: &str = "checkpoint";

/// CSV + JSON files on local disk
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join(TABLE_DIR)).map_err(|e| {
            AppError::Config(format!("Failed to create data dir {:?}: {}", root, e))
        })?;
        fs::create_dir_all(root.join(CHECKPOINT_DIR)).map_err(|e| {
            AppError::Config(format!("Failed to create checkpoint dir {:?}: {}", root, e))
        })?;
        Ok(Self { root })
    }

    pub fn table_path(&self, symbol: &str) -> PathBuf {
        self.root
            .join(TABLE_DIR)
            .join(format!("{}_evolution.csv", symbol))
    }

    pub fn metadata_path(&self, symbol: &str) -> PathBuf {
        self.root
            .join(TABLE_DIR)
            .join(format!("{}_metadata.csv", symbol))
    }

    pub fn checkpoint_path(&self, symbol: &str) -> PathBuf {
        self.root
            .join(CHECKPOINT_DIR)
            .join(format!("{}_checkpoint.json", symbol))
    }
}

/// Write `contents` next to `path`, then rename over it
fn replace_file<F>(path: &Path, contents: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        contents(&mut file)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Append to `path`, creating it when missing. `contents` is told whether
/// the file was empty. A last line without a newline is terminated first,
/// and a failed append cuts the file back to its previous length.
fn append_file<F>(path: &Path, contents: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File, bool) -> std::io::Result<()>,
{
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    let original_len = file.metadata()?.len();

    let result = (|| {
        if original_len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!("{:?} did not end with a newline; terminating its last line", path);
                file.write_all(b"\n")?;
            }
        }
        file.seek(SeekFrom::End(0))?;
        contents(&mut file, original_len == 0)?;
        file.sync_data()
    })();

    if result.is_err() {
        if let Err(e) = file.set_len(original_len).and_then(|_| file.sync_data()) {
            warn!("Failed to roll back partial append to {:?}: {}", path, e);
        }
    }
    result
}

impl TableStore for FileStore {
    fn exists(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        Ok(self.table_path(symbol).try_exists()?)
    }

    fn read_all(&self, symbol: &str) -> Result<Vec<Row>> {
        validate_symbol(symbol)?;
        let path = self.table_path(symbol);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("table {:?}", path)));
            }
            Err(e) => return Err(AppError::corrupt_table(symbol, e)),
        };

        if bytes.is_empty() {
            debug!("Table {:?} is empty", path);
        }
        decode_rows(symbol, &bytes)
    }

    fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        let path = self.table_path(symbol);
        let payload = encode_rows(rows, true)?;

        replace_file(&path, |file| file.write_all(&payload))
            .map_err(|e| AppError::storage_write(&format!("write {:?}", path), e))?;

        debug!("Wrote {} rows to {:?}", rows.len(), path);
        Ok(())
    }

    fn append(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        let path = self.table_path(symbol);
        let header = encode_rows(&[], true)?;
        let body = encode_rows(rows, false)?;

        append_file(&path, |file, empty| {
            if empty {
                file.write_all(&header)?;
            }
            file.write_all(&body)
        })
        .map_err(|e| AppError::storage_write(&format!("append {:?}", path), e))?;

        debug!("Appended {} rows to {:?}", rows.len(), path);
        Ok(())
    }
}

impl CheckpointStore for FileStore {
    fn read(&self, symbol: &str) -> Result<Option<Checkpoint>> {
        validate_symbol(symbol)?;
        let path = self.checkpoint_path(symbol);

        let payload = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::checkpoint_unavailable(symbol, e)),
        };

        CheckpointRecord::from_json(symbol, &payload).map(Some)
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_symbol(&checkpoint.symbol)?;
        let path = self.checkpoint_path(&checkpoint.symbol);
        let payload = checkpoint.to_record().to_json()?;

        replace_file(&path, |file| file.write_all(&payload))
            .map_err(|e| AppError::storage_write(&format!("write {:?}", path), e))
    }

    fn clear(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)?;
        let path = self.checkpoint_path(symbol);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::storage_write(&format!("remove {:?}", path), e)),
        }
    }
}

impl MetadataStore for FileStore {
    fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()> {
        validate_symbol(symbol)?;
        let path = self.metadata_path(symbol);

        let existing = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(AppError::storage_write(&format!("open {:?}", path), e)),
        };
        let line = encode_metadata(metadata_header(&existing)?, record, &format!("{:?}", path))?;

        append_file(&path, |file, _| file.write_all(&line))
            .map_err(|e| AppError::storage_write(&format!("append {:?}", path), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::parse_timestamp;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn row(s: &str, close: f64) -> Row {
        Row::new(parse_timestamp(s).unwrap(), 10.0, 12.0, 9.5, close, 1_000)
    }

    #[test]
    fn test_write_read_append() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();

        assert!(!store.exists("TSLA").unwrap());
        store
            .write_all("TSLA", &[row("2024-01-01 10:00:00", 11.0), row("2024-01-01 10:01:00", 11.5)])
            .unwrap();
        store.append("TSLA", &[row("2024-01-01 10:02:00", 11.25)]).unwrap();

        let contents = fs::read_to_string(store.table_path("TSLA")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "timestamp,open,high,low,close,volume");
        assert!(lines[3].starts_with("2024-01-01 10:02:00,"));
        assert_eq!(lines.len(), 4);

        let rows = store.read_all("TSLA").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], row("2024-01-01 10:02:00", 11.25));
    }

    #[test]
    fn test_append_after_hand_edited_last_line() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        fs::write(
            store.table_path("TSLA"),
            "timestamp,open,high,low,close,volume\n2024-01-02 14:30:00,1.0,1.0,1.0,1.0,1",
        )
        .unwrap();

        store.append("TSLA", &[row("2024-01-02 14:31:00", 2.0)]).unwrap();

        let rows = store.read_all("TSLA").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].volume, 1);
        assert_eq!(rows[1], row("2024-01-02 14:31:00", 2.0));
    }

    #[test]
    fn test_failed_append_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        store.write_all("TSLA", &[row("2024-01-01 10:00:00", 11.0)]).unwrap();
        let path = store.table_path("TSLA");
        let before = fs::read(&path).unwrap();

        let result = append_file(&path, |file, empty| {
            assert!(!empty);
            file.write_all(b"2024-01-01 10:01:00,10.0,12")?;
            Err(std::io::Error::new(ErrorKind::Other, "disk full"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), before);

        // The next append starts from the committed content
        store.append("TSLA", &[row("2024-01-01 10:01:00", 11.5)]).unwrap();
        assert_eq!(store.read_all("TSLA").unwrap().len(), 2);
    }

    #[test]
    fn test_header_only_table_reads_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        store.write_all("TSLA", &[]).unwrap();

        assert!(store.exists("TSLA").unwrap());
        assert_eq!(
            fs::read_to_string(store.table_path("TSLA")).unwrap().trim(),
            "timestamp,open,high,low,close,volume"
        );
        assert!(store.read_all("TSLA").unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_table_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();

        fs::write(store.table_path("BAD"), "date,price\n2024-01-01,1\n").unwrap();
        assert!(matches!(store.read_all("BAD"), Err(AppError::CorruptTable { .. })));

        fs::write(
            store.table_path("WORSE"),
            "timestamp,open,high,low,close,volume\nyesterday,1,1,1,1,1\n",
        )
        .unwrap();
        assert!(matches!(store.read_all("WORSE"), Err(AppError::CorruptTable { .. })));
    }

    #[test]
    fn test_checkpoint_round_trip_and_garbage() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.read("TSLA").unwrap().is_none());

        let cp = Checkpoint::new(
            "TSLA",
            parse_timestamp("2024-01-01 10:00:00").unwrap(),
            parse_timestamp("2024-01-01 10:02:00").unwrap(),
        )
        .unwrap();
        store.write(&cp).unwrap();
        assert_eq!(store.read("TSLA").unwrap(), Some(cp));

        fs::write(store.checkpoint_path("TSLA"), "{\"start_timestamp\": \"2024").unwrap();
        assert!(matches!(
            store.read("TSLA"),
            Err(AppError::CheckpointUnavailable { .. })
        ));

        store.clear("TSLA").unwrap();
        store.clear("TSLA").unwrap();
        assert!(store.read("TSLA").unwrap().is_none());
    }

    #[test]
    fn test_metadata_log_keeps_first_header() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();

        let mut first = BTreeMap::new();
        first.insert("shortName".to_string(), json!("Tesla, Inc."));
        first.insert("currency".to_string(), json!("USD"));
        store
            .append_metadata(
                "TSLA",
                &MetadataRecord::new(parse_timestamp("2024-01-01 10:00:00").unwrap(), first),
            )
            .unwrap();

        let mut second = BTreeMap::new();
        second.insert("currency".to_string(), json!("USD"));
        second.insert("marketCap".to_string(), json!(800_000_000_000_i64));
        store
            .append_metadata(
                "TSLA",
                &MetadataRecord::new(parse_timestamp("2024-01-02 10:00:00").unwrap(), second),
            )
            .unwrap();

        let contents = fs::read_to_string(store.metadata_path("TSLA")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,currency,shortName");
        assert_eq!(lines[1], "2024-01-01T10:00:00Z,USD,\"Tesla, Inc.\"");
        assert_eq!(lines[2], "2024-01-02T10:00:00Z,USD,");
    }

    #[test]
    fn test_rejects_unsafe_symbol() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(store.exists("../x"), Err(AppError::Validation(_))));
    }
}
