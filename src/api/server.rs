//! HTTP server for the REST API
//!
//! Provides:
//! - Health check (/, /health)
//! - Fetch-and-return (/stock-data)
//! - Incremental ingestion (/stock-data/ingest) and range lookup (/stock-data/checkpoint)

use crate::api::handlers;
use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router with all routes
pub fn router(state: Arc<AppState>) -> Router {
    // Allow all origins; the API is meant for local tooling
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/", get(handlers::health_check))
        .route("/stock-data", get(handlers::get_stock_data))
        .route(
            "/stock-data/ingest",
            get(handlers::ingest_from_upstream).post(handlers::ingest_batch),
        )
        .route("/stock-data/checkpoint", get(handlers::get_checkpoint))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server manager
pub struct ApiServer {
    state: Arc<AppState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            shutdown_tx: None,
        }
    }

    /// Bind and serve in the background; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let bind = self.state.config.bind_address();
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid address {}: {}", bind, e)))?;

        let app = router(self.state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        info!("Starting Historify API server on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            });

            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        info!("Historify API server started ({} storage)", self.state.storage.backend);
        info!("=== Endpoints ===");
        info!("  GET  http://{}/health", local_addr);
        info!("  GET  http://{}/stock-data?symbol=TSLA", local_addr);
        info!("  GET  http://{}/stock-data/ingest?symbol=TSLA", local_addr);
        info!("  POST http://{}/stock-data/ingest?symbol=TSLA", local_addr);
        info!("  GET  http://{}/stock-data/checkpoint?symbol=TSLA", local_addr);

        Ok(local_addr)
    }

    /// Stop the server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("API server stop signal sent");
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StorageBackend};
    use crate::db::memory::MemoryStore;
    use crate::db::{Storage, TableStore};
    use crate::ingest::RawBatch;
    use crate::sources::stub::StubSource;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn bar(ts: &str, close: f64) -> Value {
        json!({"datetime": ts, "open": close, "high": close, "low": close, "close": close, "volume": 10})
    }

    fn upstream_batch() -> RawBatch {
        RawBatch::from_payload(json!({
            "currency": "USD",
            "data_evolution": [bar("2024-01-02 14:30:00", 1.0), bar("2024-01-02 14:31:00", 2.0)]
        }))
        .unwrap()
    }

    fn app(batches: Vec<RawBatch>) -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::with_parts(
            AppConfig::default(),
            Storage::from_store(store.clone(), StorageBackend::Memory),
            Arc::new(StubSource::with_batches(batches)),
        );
        (store, router(Arc::new(state)))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app(vec![]);
        let (status, body) = send(app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn test_stock_data_does_not_store() {
        let (store, app) = app(vec![upstream_batch()]);
        let (status, body) = send(app, get("/stock-data?symbol=TSLA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["rows"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["rows"][0]["timestamp"], "2024-01-02 14:30:00");
        assert!(!store.exists("TSLA").unwrap());
    }

    #[tokio::test]
    async fn test_ingest_from_upstream() {
        let (store, app) = app(vec![upstream_batch()]);
        let (status, body) = send(app, get("/stock-data/ingest?symbol=TSLA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "created");
        assert_eq!(body["data"]["rows_added"], 2);
        assert_eq!(body["data"]["range_source"], "new_table");
        assert_eq!(body["data"]["checkpoint"]["range_end"], "2024-01-02 14:31:00");
        assert_eq!(store.read_all("TSLA").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway() {
        let (_, app) = app(vec![]);
        let (status, body) = send(app, get("/stock-data/ingest?symbol=TSLA")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "UPSTREAM_ERROR");
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_posted_batches_append_incrementally() {
        let (store, app) = app(vec![]);

        let first = json!({"data_evolution": [bar("2024-01-02 14:30:00", 1.0), bar("2024-01-02 14:31:00", 2.0)]});
        let (status, _) = send(app.clone(), post("/stock-data/ingest?symbol=TSLA", first)).await;
        assert_eq!(status, StatusCode::OK);

        let second = json!({"rows": [bar("2024-01-02 14:31:00", 2.0), bar("2024-01-02 14:32:00", 3.0)]});
        let (_, body) = send(app.clone(), post("/stock-data/ingest?symbol=TSLA", second)).await;
        assert_eq!(body["data"]["status"], "appended");
        assert_eq!(body["data"]["rows_added"], 1);
        assert_eq!(store.read_all("TSLA").unwrap().len(), 3);

        let (status, body) = send(app, get("/stock-data/checkpoint?symbol=TSLA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["range_source"], "checkpoint");
        assert_eq!(body["data"]["checkpoint"]["range_start"], "2024-01-02 14:30:00");
        assert_eq!(body["data"]["checkpoint"]["range_end"], "2024-01-02 14:32:00");
    }

    #[tokio::test]
    async fn test_malformed_batch_is_unprocessable() {
        let (store, app) = app(vec![]);
        let batch = json!({"data_evolution": [{"datetime": "2024-01-02 14:30:00", "open": 1.0}]});
        let (status, body) = send(app, post("/stock-data/ingest?symbol=TSLA", batch)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "MALFORMED_BATCH");
        assert!(!store.exists("TSLA").unwrap());
    }

    #[tokio::test]
    async fn test_invalid_symbol_is_bad_request() {
        let (_, app) = app(vec![]);
        let (status, body) = send(app, get("/stock-data/checkpoint?symbol=..")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
