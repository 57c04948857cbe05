//! Application state management

use crate::config::AppConfig;
use crate::db::Storage;
use crate::error::Result;
use crate::sources::{MarketDataSource, YahooSource};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Application state shared across all request handlers
pub struct AppState {
    pub config: AppConfig,

    /// Tables, checkpoints and metadata logs
    pub storage: Storage,

    /// Upstream market data source
    pub source: Arc<dyn MarketDataSource>,

    /// One lock per symbol; ingestions of the same symbol never overlap
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AppState {
    /// Open storage and the upstream source described by `config`
    pub fn new(config: AppConfig) -> Result<Self> {
        let storage = Storage::open(&config)?;
        let source = Arc::new(YahooSource::new(&config.upstream_url)?);
        Ok(Self::with_parts(config, storage, source))
    }

    pub fn with_parts(
        config: AppConfig,
        storage: Storage,
        source: Arc<dyn MarketDataSource>,
    ) -> Self {
        Self {
            config,
            storage,
            source,
            symbol_locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to a symbol's table and checkpoint
    pub async fn lock_symbol(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::db::memory::MemoryStore;
    use crate::sources::stub::StubSource;
    use std::time::Duration;

    fn state() -> AppState {
        AppState::with_parts(
            AppConfig::default(),
            Storage::from_store(Arc::new(MemoryStore::new()), StorageBackend::Memory),
            Arc::new(StubSource::default()),
        )
    }

    #[tokio::test]
    async fn test_symbol_lock_is_exclusive_per_symbol() {
        let state = state();
        let guard = state.lock_symbol("TSLA").await;

        // A different symbol is not blocked
        let other = tokio::time::timeout(Duration::from_millis(100), state.lock_symbol("AAPL")).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(100), state.lock_symbol("TSLA")).await;
        assert!(same.is_err());

        drop(guard);
        let same = tokio::time::timeout(Duration::from_millis(100), state.lock_symbol("TSLA")).await;
        assert!(same.is_ok());
    }
}
