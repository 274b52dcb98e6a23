use std::sync::Arc;

use labrun_core::config_tree::RawConfig;
use labrun_core::engine::format_result;
use labrun_core::engine::subprocess::SubprocessEngine;
use labrun_core::fingerprint::ChangeDetector;
use labrun_worker::{run_sweep, LeafStatus, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labrun_worker=debug,labrun_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = WorkerConfig::from_env();
    // A path on the command line overrides SWEEP_CONFIG.
    if let Some(path) = std::env::args().nth(1) {
        config.sweep_config = path.into();
    }
    tracing::info!(
        config = %config.sweep_config.display(),
        fingerprints = %config.fingerprint_dir.display(),
        program = %config.engine.program,
        "Worker starting",
    );

    let text = match tokio::fs::read_to_string(&config.sweep_config).await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(path = %config.sweep_config.display(), error = %e, "Cannot read sweep config");
            std::process::exit(1);
        }
    };
    let raw = match RawConfig::parse(&text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %config.sweep_config.display(), error = %e, "Invalid sweep config");
            std::process::exit(1);
        }
    };

    let detector = Arc::new(ChangeDetector::on_disk(config.fingerprint_dir.clone()));
    let engine = Arc::new(SubprocessEngine::new(config.engine.clone()));

    let report = run_sweep(&raw, detector, engine, config.concurrency).await;

    tracing::info!(
        completed = report.count(|s| matches!(s, LeafStatus::Completed(_))),
        skipped = report.count(|s| matches!(s, LeafStatus::Skipped)),
        failed = report.count(|s| matches!(s, LeafStatus::Failed(_))),
        "Sweep finished",
    );
    match report.best() {
        Some((name, value)) => {
            tracing::info!(config_name = name, result = %format_result(value), "Best result")
        }
        None => tracing::info!("No leaf produced a result in this sweep"),
    }
}
