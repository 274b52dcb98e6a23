//! Handlers for the `/jobs` resource.
//!
//! Record selectors come from the `?id=` / `?name=` query string; `name`
//! wins when both are present.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use labrun_core::config_tree::{RawConfig, Section};
use labrun_core::error::CoreError;
use labrun_core::types::DbId;
use labrun_db::models::job::{JobLookup, JobLookupQuery, OneOrMany, UpdateJob, UpsertJob};
use labrun_db::repositories::JobRepo;
use serde::Serialize;
use serde_json::Value;

use crate::engine::runner::DEFAULTS_RECORD;
use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn not_found(lookup: &JobLookup) -> AppError {
    AppError::Core(CoreError::NotFound {
        entity: "Job",
        key: lookup.to_string(),
    })
}

fn require_lookup(query: JobLookupQuery) -> AppResult<JobLookup> {
    query
        .lookup()
        .ok_or_else(|| AppError::BadRequest("Either 'id' or 'name' is required".into()))
}

fn section_to_json(section: Section) -> Value {
    Value::Object(section.into_iter().collect())
}

// ---------------------------------------------------------------------------
// List / get
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Without selectors, list every job ordered by id. With `?id=` or `?name=`,
/// return that single job or 404.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobLookupQuery>,
) -> AppResult<Response> {
    match query.lookup() {
        Some(lookup) => {
            let job = JobRepo::find(&state.pool, &lookup)
                .await?
                .ok_or_else(|| not_found(&lookup))?;
            Ok(Json(DataResponse { data: job }).into_response())
        }
        None => {
            let jobs = JobRepo::list(&state.pool).await?;
            Ok(Json(DataResponse { data: jobs }).into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Upsert one job or a list of jobs in a single transaction. Items whose
/// `id` exists are merged (non-empty fields only); the rest are created.
pub async fn upsert_jobs(
    State(state): State<AppState>,
    Json(input): Json<OneOrMany<UpsertJob>>,
) -> AppResult<impl IntoResponse> {
    let items = input.into_vec();
    let jobs = JobRepo::upsert_many(&state.pool, &items).await?;

    tracing::info!(count = jobs.len(), "Jobs upserted");

    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// PUT /api/v1/jobs?id=|name=
///
/// Partially update one job. Empty values leave fields unchanged.
pub async fn update_job(
    State(state): State<AppState>,
    Query(query): Query<JobLookupQuery>,
    Json(input): Json<UpdateJob>,
) -> AppResult<impl IntoResponse> {
    let lookup = require_lookup(query)?;
    let job = JobRepo::update(&state.pool, &lookup, &input)
        .await?
        .ok_or_else(|| not_found(&lookup))?;

    tracing::info!(job_id = job.id, "Job updated");

    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// DELETE /api/v1/jobs?id=|name=
pub async fn delete_job(
    State(state): State<AppState>,
    Query(query): Query<JobLookupQuery>,
) -> AppResult<StatusCode> {
    let lookup = require_lookup(query)?;
    if !JobRepo::delete(&state.pool, &lookup).await? {
        return Err(not_found(&lookup));
    }

    tracing::info!(%lookup, "Job deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/import
///
/// Import an INI document. `[DEFAULT]` becomes the `default` record and each
/// other section a record of the same name; existing records (first match by
/// name) have their config replaced. Returns created/updated counts.
pub async fn import_config(
    State(state): State<AppState>,
    body: String,
) -> AppResult<impl IntoResponse> {
    let raw = RawConfig::parse(&body).map_err(CoreError::from)?;

    let mut entries = Vec::with_capacity(raw.sections.len() + 1);
    if !raw.defaults.is_empty() {
        entries.push((DEFAULTS_RECORD.to_string(), section_to_json(raw.defaults)));
    }
    entries.extend(
        raw.sections
            .into_iter()
            .map(|(name, section)| (name, section_to_json(section))),
    );

    let summary = JobRepo::import_sections(&state.pool, &entries).await?;

    tracing::info!(
        created = summary.created,
        updated = summary.updated,
        "Configuration imported",
    );

    Ok(Json(DataResponse { data: summary }))
}

// ---------------------------------------------------------------------------
// Resolved preview
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ResolvedView {
    id: DbId,
    name: String,
    config: labrun_core::config_tree::ResolvedConfig,
}

/// GET /api/v1/jobs/{id}/resolved
///
/// Return the fully merged configuration the engine would receive, without
/// running anything or touching fingerprints.
pub async fn get_resolved(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let lookup = JobLookup::Id(job_id);
    let job = JobRepo::find(&state.pool, &lookup)
        .await?
        .ok_or_else(|| not_found(&lookup))?;
    let config = state.runner.resolve(&job).await?;

    Ok(Json(DataResponse {
        data: ResolvedView {
            id: job.id,
            name: job.name,
            config,
        },
    }))
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/run
///
/// Run the job if its resolved configuration changed since the last
/// successful run; otherwise return the stored result. Blocks until the
/// engine finishes.
pub async fn run_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.runner.run_job(job_id).await?;
    Ok(Json(DataResponse { data: outcome }))
}
