//! Provider quotas applied to whole runs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orchestra::core::TaskGraph;
use orchestra::orchestration::executor::DEFAULT_MODEL;
use orchestra::orchestration::{AdmissionRegistry, BatchDriver, RequestLimit};

use crate::fixtures::{executor, reviewed_task, task, ScriptedService};

const HOUR_MS: u64 = 3_600_000;

#[tokio::test(start_paused = true)]
async fn test_quota_defers_excess_calls_to_next_window() {
    let service = ScriptedService::new();
    let registry = Arc::new(AdmissionRegistry::new(RequestLimit::PerWindow(2)));
    let graph = TaskGraph::new(vec![task("a", &[]), task("b", &[]), task("c", &[])]).unwrap();

    let report = BatchDriver::new(Arc::new(
        executor(service.clone()).with_admission(registry.clone()),
    ))
    .run(&graph, &CancellationToken::new())
    .await
    .unwrap();

    assert!(report.is_success());
    let waited: Vec<u64> = report
        .results
        .iter()
        .map(|r| r.duration_ms)
        .filter(|&ms| ms >= HOUR_MS)
        .collect();
    assert_eq!(waited.len(), 1);
    assert!(report.duration_ms >= HOUR_MS);

    let metrics = registry.queue_for_model(DEFAULT_MODEL).metrics();
    assert_eq!(metrics.total_processed, 3);
    assert_eq!(metrics.queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_and_qc_calls_share_the_quota() {
    let service = ScriptedService::new();
    let registry = Arc::new(AdmissionRegistry::with_window(
        RequestLimit::PerWindow(1),
        Duration::from_secs(60),
    ));

    let result = executor(service.clone())
        .with_admission(registry)
        .execute(&reviewed_task("solo", &[]), &[])
        .await;

    assert!(result.is_success());
    // The QC call waits for the window after the worker call.
    assert!(result.duration_ms >= 60_000);
    assert!(result.duration_ms < 120_000);
}

#[tokio::test(start_paused = true)]
async fn test_providers_are_limited_independently() {
    let service = ScriptedService::new();
    let mut registry = AdmissionRegistry::new(RequestLimit::Unlimited);
    registry.add_route("claude-", "anthropic");
    registry.register("anthropic", RequestLimit::PerWindow(1));
    let graph = TaskGraph::new(vec![
        task("opus-1", &[]).with_model("claude-3-opus"),
        task("opus-2", &[]).with_model("claude-3-opus"),
        task("gpt", &[]),
    ])
    .unwrap();

    let report = BatchDriver::new(Arc::new(
        executor(service.clone()).with_admission(Arc::new(registry)),
    ))
    .run(&graph, &CancellationToken::new())
    .await
    .unwrap();

    assert!(report.is_success());
    assert!(report.result("gpt").unwrap().duration_ms < 1_000);
    let slow = ["opus-1", "opus-2"]
        .iter()
        .filter(|id| report.result(id).unwrap().duration_ms >= HOUR_MS)
        .count();
    assert_eq!(slow, 1);
}
