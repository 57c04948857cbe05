//! S3 backend
//!
//! Same object layout as the filesystem backend, under an optional prefix:
//!
//! ```text
//! {prefix}/fetch/{SYMBOL}_evolution.csv
//! {prefix}/fetch/{SYMBOL}_metadata.csv
//! {prefix}/checkpoint/{SYMBOL}_checkpoint.json
//! ```
//!
//! Objects cannot be appended to, so appends read the object, extend it and
//! put it back whole. A failed put leaves the previous object in place.
//!
//! The store traits are blocking; calls are driven on the runtime captured at
//! construction and must come from blocking threads (`spawn_blocking`).

use super::codec::{
    append_rows, decode_rows, encode_metadata, encode_rows, line_break_before_append,
    metadata_header,
};
use super::models::{Checkpoint, CheckpointRecord, MetadataRecord, Row};
use super::{validate_symbol, CheckpointStore, MetadataStore, TableStore};
use crate::config::S3Config;
use crate::error::{AppError, Result};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::future::Future;
use tokio::runtime::Handle;
use tracing::{debug, info};

const CSV_CONTENT_TYPE: &str = "text/csv";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Object keys for a bucket prefix
#[derive(Debug, Clone)]
pub struct ObjectKeys {
    prefix: String,
}

impl ObjectKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key(&self, path: String) -> String {
        if self.prefix.is_empty() {
            path
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    pub fn table(&self, symbol: &str) -> String {
        self.key(format!("fetch/{}_evolution.csv", symbol))
    }

    pub fn metadata(&self, symbol: &str) -> String {
        self.key(format!("fetch/{}_metadata.csv", symbol))
    }

    pub fn checkpoint(&self, symbol: &str) -> String {
        self.key(format!("checkpoint/{}_checkpoint.json", symbol))
    }
}

/// Tables, checkpoints and metadata logs in an S3 bucket
pub struct S3Store {
    client: Client,
    bucket: String,
    keys: ObjectKeys,
    runtime: Handle,
}

impl S3Store {
    /// Build the client; must be called from within a tokio runtime
    pub fn new(config: &S3Config) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            AppError::Config(format!("s3 backend needs a tokio runtime: {}", e))
        })?;

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
            None,
            "historify",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        info!(
            "S3 storage in bucket {} (prefix '{}', region {})",
            config.bucket, config.prefix, config.region
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            keys: ObjectKeys::new(&config.prefix),
            runtime,
        })
    }

    pub fn keys(&self) -> &ObjectKeys {
        &self.keys
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Object body, `None` when the key does not exist
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.block_on(async {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) => {
                    debug!("{} not found", self.location(key));
                    return Ok(None);
                }
                Err(e) => {
                    return Err(AppError::ObjectStore(format!(
                        "get {}: {}",
                        self.location(key),
                        DisplayErrorContext(&e)
                    )));
                }
            };

            let body = output.body.collect().await.map_err(|e| {
                AppError::ObjectStore(format!("read {}: {}", self.location(key), e))
            })?;
            Ok(Some(body.into_bytes().to_vec()))
        })
    }

    fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let size = body.len();
        self.block_on(
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(body))
                .send(),
        )
        .map_err(|e| {
            AppError::storage_write(&format!("put {}", self.location(key)), DisplayErrorContext(&e))
        })?;

        debug!("Wrote {} bytes to {}", size, self.location(key));
        Ok(())
    }
}

impl TableStore for S3Store {
    fn exists(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        let key = self.keys.table(symbol);

        let result = self.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send(),
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(AppError::ObjectStore(format!(
                "head {}: {}",
                self.location(&key),
                DisplayErrorContext(&e)
            ))),
        }
    }

    fn read_all(&self, symbol: &str) -> Result<Vec<Row>> {
        validate_symbol(symbol)?;
        let key = self.keys.table(symbol);
        match self.get(&key)? {
            Some(bytes) => decode_rows(symbol, &bytes),
            None => Err(AppError::NotFound(format!("table {}", self.location(&key)))),
        }
    }

    fn write_all(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        self.put(&self.keys.table(symbol), encode_rows(rows, true)?, CSV_CONTENT_TYPE)
    }

    fn append(&self, symbol: &str, rows: &[Row]) -> Result<()> {
        validate_symbol(symbol)?;
        let key = self.keys.table(symbol);

        let mut content = self.get(&key)?.unwrap_or_default();
        append_rows(&mut content, rows)?;
        self.put(&key, content, CSV_CONTENT_TYPE)?;

        debug!("Appended {} rows to {}", rows.len(), self.location(&key));
        Ok(())
    }
}

impl CheckpointStore for S3Store {
    fn read(&self, symbol: &str) -> Result<Option<Checkpoint>> {
        validate_symbol(symbol)?;
        match self.get(&self.keys.checkpoint(symbol))? {
            Some(payload) => CheckpointRecord::from_json(symbol, &payload).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_symbol(&checkpoint.symbol)?;
        let payload = checkpoint.to_record().to_json()?;
        self.put(&self.keys.checkpoint(&checkpoint.symbol), payload, JSON_CONTENT_TYPE)
    }

    fn clear(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)?;
        let key = self.keys.checkpoint(symbol);

        // Deleting a missing key succeeds
        self.block_on(
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send(),
        )
        .map_err(|e| {
            AppError::storage_write(&format!("delete {}", self.location(&key)), DisplayErrorContext(&e))
        })?;
        Ok(())
    }
}

impl MetadataStore for S3Store {
    fn append_metadata(&self, symbol: &str, record: &MetadataRecord) -> Result<()> {
        validate_symbol(symbol)?;
        let key = self.keys.metadata(symbol);

        let mut content = self.get(&key)?.unwrap_or_default();
        let line = encode_metadata(metadata_header(&content)?, record, &self.location(&key))?;
        let line_break = line_break_before_append(&content);
        content.extend_from_slice(line_break);
        content.extend_from_slice(&line);

        self.put(&key, content, CSV_CONTENT_TYPE)
    }
}
