//! Runs a stored job: resolve its configuration, skip when nothing changed,
//! otherwise evaluate it in a fresh engine process and persist the result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use labrun_core::config_tree::{
    ancestor_chain, resolve_leaf, section_from_json, ResolvedConfig, Section, Sections,
};
use labrun_core::engine::{format_result, ComputeEngine};
use labrun_core::error::CoreError;
use labrun_core::fingerprint::ChangeDetector;
use labrun_core::types::DbId;
use labrun_db::models::job::Job;
use labrun_db::repositories::JobRepo;
use labrun_db::DbPool;
use serde::Serialize;

use crate::error::AppResult;

/// Name of the record whose config supplies defaults for every job.
pub const DEFAULTS_RECORD: &str = "default";

/// Outcome of a successful trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub id: DbId,
    pub result: String,
    /// `false` when the configuration was unchanged and the stored result
    /// was returned without running the engine.
    pub executed: bool,
}

/// Executes jobs against a [`ComputeEngine`], one run per job id at a time.
pub struct JobRunner {
    pool: DbPool,
    detector: Arc<ChangeDetector>,
    engine: Arc<dyn ComputeEngine>,
    in_flight: Arc<Mutex<HashSet<DbId>>>,
}

impl JobRunner {
    pub fn new(pool: DbPool, detector: Arc<ChangeDetector>, engine: Arc<dyn ComputeEngine>) -> Self {
        Self {
            pool,
            detector,
            engine,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Trigger job `id`.
    ///
    /// Returns `Conflict` while another run of the same id is in progress,
    /// `NotFound` if the job does not exist, and `Execution` when the engine
    /// fails. A failed run leaves the stored result untouched and forgets
    /// the fingerprint so the next trigger runs again.
    pub async fn run_job(&self, id: DbId) -> AppResult<RunOutcome> {
        let claim = self.claim(id)?;

        let job = JobRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| not_found(id))?;
        let resolved = self.resolve(&job).await?;
        let key = job.fingerprint_key();
        let name = job.display_name();

        if !self.detector.has_changed(&key, &resolved).await? {
            tracing::info!(job_id = id, name = %name, "Configuration unchanged, skipping run");
            return Ok(RunOutcome {
                id,
                result: job.result,
                executed: false,
            });
        }

        // From here on the stored fingerprint describes a run that has not
        // finished. It is kept only once the result is persisted.
        let pending = PendingRun {
            detector: Arc::clone(&self.detector),
            key,
            claim: Some(claim),
        };

        tracing::info!(job_id = id, name = %name, options = resolved.len(), "Running job");
        let outcome = self.execute(id, &name, &resolved).await;

        match &outcome {
            Ok(_) => pending.commit(),
            Err(_) => pending.rollback().await,
        }
        outcome
    }

    /// Resolve a job's configuration against the other stored records.
    ///
    /// The first record named after each ancestor prefix of the job's name
    /// contributes its config, the record named [`DEFAULTS_RECORD`] supplies
    /// defaults, and the job's own config is applied last.
    pub async fn resolve(&self, job: &Job) -> AppResult<ResolvedConfig> {
        let leaf = parse_section(&job.config.0)?;

        let mut sections = Sections::new();
        for ancestor in ancestor_chain(&job.name) {
            if let Some(record) = JobRepo::find_by_name(&self.pool, ancestor).await? {
                sections.insert(ancestor.to_string(), parse_section(&record.config.0)?);
            }
        }

        let defaults = match JobRepo::find_by_name(&self.pool, DEFAULTS_RECORD).await? {
            Some(record) => parse_section(&record.config.0)?,
            None => Section::new(),
        };

        Ok(resolve_leaf(&sections, &defaults, &job.name, &leaf))
    }

    async fn execute(&self, id: DbId, name: &str, resolved: &ResolvedConfig) -> AppResult<RunOutcome> {
        let value = self
            .engine
            .compute(name, resolved)
            .await
            .map_err(CoreError::from)?;
        let result = format_result(value);

        if !JobRepo::set_result(&self.pool, id, &result).await? {
            // Deleted while the engine was running.
            return Err(not_found(id).into());
        }

        tracing::info!(job_id = id, name = %name, result = %result, "Job completed");
        Ok(RunOutcome {
            id,
            result,
            executed: true,
        })
    }

    fn claim(&self, id: DbId) -> Result<InFlight, CoreError> {
        let mut running = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(id) {
            return Err(CoreError::Conflict(format!("Job {id} is already running")));
        }
        Ok(InFlight {
            running: Arc::clone(&self.in_flight),
            id,
        })
    }

    /// Whether a run of job `id` is currently in progress.
    pub fn is_running(&self, id: DbId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    /// Number of jobs with a run in progress.
    pub fn running_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Releases a job id from the in-flight set when dropped.
struct InFlight {
    running: Arc<Mutex<HashSet<DbId>>>,
    id: DbId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// A run whose fingerprint has been stored but whose result has not.
///
/// Unless [`commit`](Self::commit) is called, the fingerprint is forgotten:
/// directly by [`rollback`](Self::rollback), or from a spawned task when the
/// run future is dropped (client disconnect, shutdown). The job stays claimed
/// until the fingerprint is gone, so no trigger can observe it in between.
struct PendingRun {
    detector: Arc<ChangeDetector>,
    key: String,
    claim: Option<InFlight>,
}

impl PendingRun {
    fn commit(mut self) {
        self.claim.take();
    }

    async fn rollback(mut self) {
        forget_fingerprint(&self.detector, &self.key).await;
        self.claim.take();
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let detector = Arc::clone(&self.detector);
        let key = std::mem::take(&mut self.key);
        tracing::warn!(name = %key, "Run cancelled before completion");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    forget_fingerprint(&detector, &key).await;
                    drop(claim);
                });
            }
            Err(_) => {
                tracing::error!(name = %key, "No runtime to invalidate fingerprint of cancelled run");
            }
        }
    }
}

async fn forget_fingerprint(detector: &ChangeDetector, key: &str) {
    if let Err(e) = detector.invalidate(key).await {
        tracing::error!(name = %key, error = %e, "Failed to invalidate fingerprint");
    }
}

fn parse_section(value: &serde_json::Value) -> Result<Section, CoreError> {
    Ok(section_from_json(value)?)
}

fn not_found(id: DbId) -> CoreError {
    CoreError::NotFound {
        entity: "Job",
        key: format!("id {id}"),
    }
}
