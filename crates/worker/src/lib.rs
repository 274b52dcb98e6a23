//! Batch sweep over an INI configuration file.
//!
//! Every leaf section is resolved and, when its configuration changed since
//! the last successful run, evaluated in a fresh engine process. Failures
//! are recorded per leaf and never stop the sweep.

use std::path::PathBuf;
use std::sync::Arc;

use labrun_core::config_tree::RawConfig;
use labrun_core::engine::subprocess::EngineConfig;
use labrun_core::engine::{format_result, ComputeEngine};
use labrun_core::fingerprint::ChangeDetector;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// INI file to sweep.
    pub sweep_config: PathBuf,
    /// Directory holding one fingerprint file per configuration name.
    pub fingerprint_dir: PathBuf,
    /// Maximum number of engine processes running at once.
    pub concurrency: usize,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// | Env Var             | Default        |
    /// |---------------------|----------------|
    /// | `SWEEP_CONFIG`      | `config.ini`   |
    /// | `FINGERPRINT_DIR`   | `fingerprints` |
    /// | `SWEEP_CONCURRENCY` | `1`            |
    ///
    /// Engine settings are read by [`EngineConfig::from_env`].
    pub fn from_env() -> Self {
        let sweep_config = std::env::var("SWEEP_CONFIG")
            .unwrap_or_else(|_| "config.ini".into())
            .into();

        let fingerprint_dir = std::env::var("FINGERPRINT_DIR")
            .unwrap_or_else(|_| "fingerprints".into())
            .into();

        let concurrency: usize = std::env::var("SWEEP_CONCURRENCY")
            .unwrap_or_else(|_| "1".into())
            .parse()
            .expect("SWEEP_CONCURRENCY must be a valid usize");

        Self {
            sweep_config,
            fingerprint_dir,
            concurrency: concurrency.max(1),
            engine: EngineConfig::from_env(),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LeafStatus {
    Completed(f64),
    /// Configuration unchanged since the last successful run.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafOutcome {
    pub name: String,
    pub status: LeafStatus,
}

/// Per-leaf outcomes in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub outcomes: Vec<LeafOutcome>,
}

impl SweepReport {
    /// The completed leaf with the lowest result. NaN results never win.
    pub fn best(&self) -> Option<(&str, f64)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome.status {
                LeafStatus::Completed(value) if !value.is_nan() => {
                    Some((outcome.name.as_str(), value))
                }
                _ => None,
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn count(&self, pred: impl Fn(&LeafStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Run every leaf of `raw`, at most `concurrency` engine processes at once.
pub async fn run_sweep(
    raw: &RawConfig,
    detector: Arc<ChangeDetector>,
    engine: Arc<dyn ComputeEngine>,
    concurrency: usize,
) -> SweepReport {
    let leaves = raw.resolve();
    tracing::info!(leaves = leaves.len(), concurrency, "Starting sweep");

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, (name, resolved)) in leaves.into_iter().enumerate() {
        let detector = Arc::clone(&detector);
        let engine = Arc::clone(&engine);
        let permits = Arc::clone(&permits);

        tasks.spawn(async move {
            let status = match permits.acquire_owned().await {
                Ok(_permit) => run_leaf(&name, &resolved, &detector, engine.as_ref()).await,
                Err(_) => LeafStatus::Failed("sweep cancelled".to_string()),
            };
            (index, LeafOutcome { name, status })
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!(error = %e, "Sweep task panicked"),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    SweepReport {
        outcomes: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
    }
}

async fn run_leaf(
    name: &str,
    resolved: &labrun_core::config_tree::ResolvedConfig,
    detector: &ChangeDetector,
    engine: &dyn ComputeEngine,
) -> LeafStatus {
    match detector.has_changed(name, resolved).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(config_name = name, "Unchanged, skipping");
            return LeafStatus::Skipped;
        }
        Err(e) => {
            tracing::error!(config_name = name, error = %e, "Change detection failed");
            return LeafStatus::Failed(e.to_string());
        }
    }

    match engine.compute(name, resolved).await {
        Ok(value) => {
            tracing::info!(config_name = name, result = %format_result(value), "Leaf completed");
            LeafStatus::Completed(value)
        }
        Err(e) => {
            tracing::warn!(config_name = name, error = %e, "Leaf failed");
            if let Err(e) = detector.invalidate(name).await {
                tracing::error!(config_name = name, error = %e, "Failed to invalidate fingerprint");
            }
            LeafStatus::Failed(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
