//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                -> list_jobs (or one job with ?id= / ?name=)
/// POST   /                -> upsert_jobs
/// PUT    /?id=|name=      -> update_job
/// DELETE /?id=|name=      -> delete_job
/// POST   /import          -> import_config
/// GET    /{id}/resolved   -> get_resolved
/// POST   /{id}/run        -> run_job (no request timeout)
/// ```
pub fn router(timeout: TimeoutLayer) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(jobs::list_jobs)
                .post(jobs::upsert_jobs)
                .put(jobs::update_job)
                .delete(jobs::delete_job),
        )
        .route("/import", post(jobs::import_config))
        .route("/{id}/resolved", get(jobs::get_resolved))
        .route_layer(timeout)
        // Bounded by the engine timeout instead.
        .route("/{id}/run", post(jobs::run_job))
}
