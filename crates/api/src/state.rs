use std::sync::Arc;

use crate::config::ServerConfig;
use crate::engine::runner::JobRunner;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: labrun_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Executes jobs: resolve, change check, isolated compute, store result.
    pub runner: Arc<JobRunner>,
}
