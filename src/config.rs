//! Application configuration loaded from the environment

use crate::error::{AppError, Result};
use crate::sources::yahoo::DEFAULT_BASE_URL;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which storage backend holds tables, checkpoints and metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    DuckDb,
    S3,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fs" | "file" | "files" => Ok(StorageBackend::Fs),
            "duckdb" => Ok(StorageBackend::DuckDb),
            "s3" => Ok(StorageBackend::S3),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            other => Err(AppError::Config(format!(
                "Unknown storage backend '{}' (expected fs, duckdb, s3 or memory)",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageBackend::Fs => "fs",
            StorageBackend::DuckDb => "duckdb",
            StorageBackend::S3 => "s3",
            StorageBackend::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Bucket and credentials of the `s3` backend
#[derive(Clone, Serialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix in front of `fetch/` and `checkpoint/`, may be empty
    pub prefix: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2)
    pub endpoint: Option<String>,
    pub access_key_id: String,
    #[serde(skip_serializing)]
    pub secret_access_key: String,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub backend: StorageBackend,
    pub upstream_url: String,
    pub default_interval: String,
    pub default_period: Option<String>,
    /// Set when the `s3` backend is selected
    pub s3: Option<S3Config>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            data_dir: PathBuf::from("data"),
            backend: StorageBackend::Fs,
            upstream_url: DEFAULT_BASE_URL.to_string(),
            default_interval: "1m".to_string(),
            default_period: Some("1d".to_string()),
            s3: None,
        }
    }
}

impl AppConfig {
    /// Load from `HISTORIFY_*` variables, reading `.env` first when present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("HISTORIFY_HOST") {
            config.host = host;
        }
        if let Some(port) = get("HISTORIFY_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| AppError::Config(format!("HISTORIFY_PORT must be a port number, got '{}'", port)))?;
        }
        if let Some(dir) = get("HISTORIFY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = get("HISTORIFY_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(url) = get("HISTORIFY_UPSTREAM_URL") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(AppError::Config(format!(
                    "HISTORIFY_UPSTREAM_URL must be an http(s) URL, got '{}'",
                    url
                )));
            }
            config.upstream_url = url;
        }
        if let Some(interval) = get("HISTORIFY_DEFAULT_INTERVAL") {
            config.default_interval = interval;
        }
        if let Some(period) = get("HISTORIFY_DEFAULT_PERIOD") {
            // "none" lets the start/end window (or the source default) decide
            config.default_period = (!period.eq_ignore_ascii_case("none")).then_some(period);
        }
        if config.backend == StorageBackend::S3 {
            config.s3 = Some(S3Config::from_lookup(&get)?);
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl S3Config {
    /// Read the bucket settings alone, e.g. when the backend is chosen on the command line
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(&|key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    fn from_lookup<F>(get: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                AppError::Config(format!("{} is required for the s3 backend", key))
            })
        };

        Ok(Self {
            bucket: required("HISTORIFY_S3_BUCKET")?,
            prefix: get("HISTORIFY_S3_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
            region: get("HISTORIFY_S3_REGION")
                .or_else(|| get("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: get("HISTORIFY_S3_ENDPOINT"),
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            session_token: get("AWS_SESSION_TOKEN"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
        assert_eq!(config.backend, StorageBackend::Fs);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.default_interval, "1m");
        assert_eq!(config.default_period.as_deref(), Some("1d"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HISTORIFY_PORT", "9100"),
            ("HISTORIFY_BACKEND", "DuckDB"),
            ("HISTORIFY_DATA_DIR", "/var/lib/historify"),
            ("HISTORIFY_DEFAULT_PERIOD", "none"),
            ("HISTORIFY_HOST", "  "),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.backend, StorageBackend::DuckDb);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/historify"));
        assert_eq!(config.default_period, None);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(load(&[("HISTORIFY_PORT", "http")]), Err(AppError::Config(_))));
        assert!(matches!(load(&[("HISTORIFY_BACKEND", "hdfs")]), Err(AppError::Config(_))));
        assert!(matches!(
            load(&[("HISTORIFY_UPSTREAM_URL", "ftp://example")]),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_s3_backend_settings() {
        let err = load(&[("HISTORIFY_BACKEND", "s3")]).unwrap_err();
        assert!(err.to_string().contains("HISTORIFY_S3_BUCKET"));

        let err = load(&[("HISTORIFY_BACKEND", "s3"), ("HISTORIFY_S3_BUCKET", "market-data")])
            .unwrap_err();
        assert!(err.to_string().contains("AWS_ACCESS_KEY_ID"));

        let config = load(&[
            ("HISTORIFY_BACKEND", "s3"),
            ("HISTORIFY_S3_BUCKET", "market-data"),
            ("HISTORIFY_S3_PREFIX", "/historify/"),
            ("AWS_REGION", "sa-east-1"),
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI"),
        ])
        .unwrap();
        assert_eq!(config.backend, StorageBackend::S3);
        let s3 = config.s3.unwrap();
        assert_eq!(s3.bucket, "market-data");
        assert_eq!(s3.prefix, "historify");
        assert_eq!(s3.region, "sa-east-1");
        assert_eq!(s3.endpoint, None);
        assert!(!format!("{:?}", s3).contains("wJalrXUtnFEMI"));

        // Bucket settings are ignored by the other backends
        assert!(load(&[("HISTORIFY_S3_BUCKET", "market-data")]).unwrap().s3.is_none());
    }

    #[test]
    fn test_backend_display_round_trip() {
        for backend in [
            StorageBackend::Fs,
            StorageBackend::DuckDb,
            StorageBackend::S3,
            StorageBackend::Memory,
        ] {
            assert_eq!(backend.to_string().parse::<StorageBackend>().unwrap(), backend);
        }
    }
}
