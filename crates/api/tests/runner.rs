//! Integration tests for `JobRunner` against an in-memory database.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::StubEngine;
use labrun_api::error::AppError;
use labrun_core::error::CoreError;
use labrun_db::models::job::{UpdateJob, UpsertJob};
use labrun_db::repositories::JobRepo;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn seed(pool: &labrun_db::DbPool, name: &str, config: serde_json::Value) -> i64 {
    let input = UpsertJob {
        id: None,
        fields: UpdateJob {
            name: Some(name.to_string()),
            config: Some(config),
            result: None,
        },
    };
    JobRepo::create(pool, &input).await.unwrap().id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_run_of_unchanged_job_skips_engine() {
    let pool = common::test_pool().await;
    let engine = StubEngine::returning(0.42);
    let runner = common::test_runner(pool.clone(), engine.clone());
    let id = seed(&pool, "exp1", json!({"noise": "0.1"})).await;

    let first = runner.run_job(id).await.unwrap();
    assert!(first.executed);
    assert_eq!(first.result, "0.42");

    let second = runner.run_job(id).await.unwrap();
    assert!(!second.executed);
    assert_eq!(second.result, "0.42");
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn concurrent_trigger_for_same_job_conflicts() {
    let pool = common::test_pool().await;
    let engine = StubEngine::slow(1.0, Duration::from_millis(200));
    let runner = common::test_runner(pool.clone(), engine.clone());
    let id = seed(&pool, "exp1", json!({})).await;

    let (first, second) = tokio::join!(runner.run_job(id), runner.run_job(id));

    assert_eq!(first.unwrap().result, "1.0");
    assert_matches!(second, Err(AppError::Core(CoreError::Conflict(_))));
    assert_eq!(engine.calls(), 1);
    assert!(!runner.is_running(id));
}

#[tokio::test]
async fn different_jobs_run_concurrently() {
    let pool = common::test_pool().await;
    let engine = StubEngine::slow(1.0, Duration::from_millis(100));
    let runner = common::test_runner(pool.clone(), engine.clone());
    let a = seed(&pool, "a", json!({})).await;
    let b = seed(&pool, "b", json!({})).await;

    let (first, second) = tokio::join!(runner.run_job(a), runner.run_job(b));

    assert!(first.unwrap().executed);
    assert!(second.unwrap().executed);
    assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn failure_releases_job_and_preserves_result() {
    let pool = common::test_pool().await;
    let engine = StubEngine::failing();
    let runner = common::test_runner(pool.clone(), engine.clone());
    let id = seed(&pool, "exp1", json!({})).await;
    JobRepo::set_result(&pool, id, "7.0").await.unwrap();

    let err = runner.run_job(id).await.unwrap_err();
    assert_matches!(err, AppError::Core(CoreError::Execution(_)));
    assert!(!runner.is_running(id));

    let stored = JobRepo::find_by_id(&pool, id).await.unwrap().unwrap();
    assert_eq!(stored.result, "7.0");
}

#[tokio::test]
async fn cancelled_run_is_retried_on_next_trigger() {
    let pool = common::test_pool().await;
    let engine = StubEngine::slow(0.42, Duration::from_millis(500));
    let runner = common::test_runner(pool.clone(), engine.clone());
    let id = seed(&pool, "exp1", json!({"noise": "0.1"})).await;

    let cancelled = tokio::time::timeout(Duration::from_millis(50), runner.run_job(id)).await;
    assert!(cancelled.is_err(), "run should still be in progress");

    // The claim is held until the fingerprint of the abandoned run is gone.
    while runner.is_running(id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let retried = runner.run_job(id).await.unwrap();
    assert!(retried.executed);
    assert_eq!(retried.result, "0.42");
    assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn unnamed_job_does_not_share_fingerprint_with_lookalike_name() {
    let pool = common::test_pool().await;
    let engine = StubEngine::returning(2.0);
    let runner = common::test_runner(pool.clone(), engine.clone());
    let unnamed = seed(&pool, "", json!({"k": "v"})).await;
    let named = seed(&pool, &format!("job_{unnamed}"), json!({"k": "v"})).await;

    assert!(runner.run_job(unnamed).await.unwrap().executed);
    assert!(runner.run_job(named).await.unwrap().executed);
    assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn unnamed_jobs_are_tracked_per_id() {
    let pool = common::test_pool().await;
    let engine = StubEngine::returning(2.0);
    let runner = common::test_runner(pool.clone(), engine.clone());
    let a = seed(&pool, "", json!({"k": "v"})).await;
    let b = seed(&pool, "", json!({"k": "v"})).await;

    assert!(runner.run_job(a).await.unwrap().executed);
    assert!(runner.run_job(b).await.unwrap().executed);
    assert_eq!(engine.calls(), 2);
}

#[tokio::test]
async fn resolve_skips_undefined_ancestors() {
    let pool = common::test_pool().await;
    let runner = common::test_runner(pool.clone(), StubEngine::returning(0.0));
    seed(&pool, "default", json!({"a": "1"})).await;
    seed(&pool, "p", json!({"a": "2", "from_p": "yes"})).await;
    let id = seed(&pool, "p.q.r", json!({"b": "3"})).await;

    let job = JobRepo::find_by_id(&pool, id).await.unwrap().unwrap();
    let resolved = runner.resolve(&job).await.unwrap();

    assert_eq!(resolved.get("a"), Some(&json!("2")));
    assert_eq!(resolved.get("from_p"), Some(&json!("yes")));
    assert_eq!(resolved.get("b"), Some(&json!("3")));
    assert_eq!(resolved.len(), 3);
}
