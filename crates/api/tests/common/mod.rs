#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use labrun_core::config_tree::ResolvedConfig;
use labrun_core::engine::subprocess::EngineConfig;
use labrun_core::engine::{ComputeEngine, ComputeError};
use labrun_core::fingerprint::{ChangeDetector, MemoryFingerprintStore, TextRenderer};
use labrun_db::DbPool;
use tower::ServiceExt;

use labrun_api::config::ServerConfig;
use labrun_api::engine::runner::JobRunner;
use labrun_api::router::build_app_router;
use labrun_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default)
/// and a 30-second request timeout.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        fingerprint_dir: "unused".into(),
        engine: EngineConfig {
            program: "true".to_string(),
            args: Vec::new(),
            working_directory: None,
            timeout: Duration::from_secs(5),
        },
    }
}

/// A fresh, migrated in-memory database.
pub async fn test_pool() -> DbPool {
    let pool = labrun_db::create_memory_pool().await.unwrap();
    labrun_db::run_migrations(&pool).await.unwrap();
    pool
}

// ---------------------------------------------------------------------------
// Stub engine
// ---------------------------------------------------------------------------

/// In-process engine returning a fixed value (or failing), counting calls
/// and remembering the last configuration it received.
pub struct StubEngine {
    value: Mutex<Option<f64>>,
    delay: Duration,
    calls: AtomicUsize,
    last_config: Mutex<Option<ResolvedConfig>>,
}

impl StubEngine {
    pub fn returning(value: f64) -> Arc<Self> {
        Arc::new(Self::build(Some(value), Duration::ZERO))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(None, Duration::ZERO))
    }

    pub fn slow(value: f64, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(value), delay))
    }

    fn build(value: Option<f64>, delay: Duration) -> Self {
        Self {
            value: Mutex::new(value),
            delay,
            calls: AtomicUsize::new(0),
            last_config: Mutex::new(None),
        }
    }

    /// Switch between returning `Some(value)` and failing (`None`).
    pub fn set_value(&self, value: Option<f64>) {
        *self.value.lock().unwrap() = value;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<ResolvedConfig> {
        self.last_config.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeEngine for StubEngine {
    async fn compute(&self, _name: &str, config: &ResolvedConfig) -> Result<f64, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let value = *self.value.lock().unwrap();
        value.ok_or_else(|| ComputeError::ExitStatus {
            exit_code: 1,
            stderr: "engine crashed".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// App builders
// ---------------------------------------------------------------------------

/// Build a runner over `pool` with an in-memory fingerprint store.
pub fn test_runner(pool: DbPool, engine: Arc<StubEngine>) -> Arc<JobRunner> {
    let detector = Arc::new(ChangeDetector::new(
        Arc::new(TextRenderer),
        Arc::new(MemoryFingerprintStore::new()),
    ));
    Arc::new(JobRunner::new(pool, detector, engine))
}

/// Build the full application router with the production middleware stack.
pub fn build_test_app(pool: DbPool, engine: Arc<StubEngine>) -> Router {
    build_test_app_with(pool, engine, test_config())
}

/// Like [`build_test_app`] with a custom server configuration.
pub fn build_test_app_with(pool: DbPool, engine: Arc<StubEngine>, config: ServerConfig) -> Router {
    let runner = test_runner(pool.clone(), engine);

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        runner,
    };

    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn with_json(
    app: Router,
    method: Method,
    uri: &str,
    body: serde_json::Value,
) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    with_json(app, Method::POST, uri, body).await
}

pub async fn put_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    with_json(app, Method::PUT, uri, body).await
}

pub async fn post_text(app: Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
