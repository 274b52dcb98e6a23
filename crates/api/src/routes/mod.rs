pub mod health;
pub mod jobs;

use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                       list / get, upsert, update, delete
/// /jobs/import                import INI sections as jobs (POST)
/// /jobs/{id}/resolved         resolved configuration preview (GET)
/// /jobs/{id}/run              trigger a run (POST)
/// ```
///
/// `timeout` applies to every route except job runs.
pub fn api_routes(timeout: TimeoutLayer) -> Router<AppState> {
    Router::new().nest("/jobs", jobs::router(timeout))
}
