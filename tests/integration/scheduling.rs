//! Batch scheduling through the driver.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orchestra::core::TaskGraph;
use orchestra::orchestration::{BatchDriver, RunStatus};
use orchestra::Error;

use crate::fixtures::{diamond_tasks, executor, task, RecordingSink, ScriptedService};

#[tokio::test]
async fn test_diamond_runs_in_three_batches() {
    let service = ScriptedService::new();
    let graph = TaskGraph::new(diamond_tasks()).unwrap();
    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.batches,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]
    );
    assert_eq!(report.succeeded, 4);

    let order = service.worker_order();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));
}

#[tokio::test(start_paused = true)]
async fn test_tasks_in_a_batch_run_concurrently() {
    let service = ScriptedService::with_delay(Duration::from_secs(10));
    let graph = TaskGraph::new(vec![
        task("one", &[]),
        task("two", &[]),
        task("three", &[]),
        task("after", &["one", "two", "three"]),
    ])
    .unwrap();

    let started = tokio::time::Instant::now();
    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(service.max_in_flight(), 3);
    // Two batches of one round each.
    assert!(started.elapsed() < Duration::from_secs(25));
}

#[tokio::test]
async fn test_batch_boundaries_are_respected() {
    let service = ScriptedService::new();
    let graph = TaskGraph::new(vec![
        task("lint", &[]),
        task("compile", &[]),
        task("link", &["compile"]),
        task("package", &["link", "lint"]),
    ])
    .unwrap();
    BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    let order = service.worker_order();
    let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
    assert!(pos("compile") < pos("link"));
    assert!(pos("lint") < pos("link"));
    assert!(pos("link") < pos("package"));
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_call() {
    let service = ScriptedService::new();
    let graph = TaskGraph::new(vec![
        task("a", &["c"]),
        task("b", &["a"]),
        task("c", &["b"]),
        task("free", &[]),
    ])
    .unwrap();
    let err = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::CycleDetected { task_ids } => {
            assert!(task_ids.contains(&"a".to_string()));
            assert!(!task_ids.contains(&"free".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(service.requests().is_empty());
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let err = TaskGraph::new(vec![task("a", &["ghost"])]).unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownDependency { ref task, ref dependency } if task == "a" && dependency == "ghost"
    ));
}

#[tokio::test]
async fn test_empty_graph_completes_immediately() {
    let sink = RecordingSink::new();
    let graph = TaskGraph::new(Vec::new()).unwrap();
    let report = BatchDriver::new(Arc::new(executor(ScriptedService::new())))
        .with_sink(sink.clone())
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.total, 0);
    assert_eq!(sink.kinds(), vec!["run_started", "run_completed"]);
}

#[tokio::test]
async fn test_progress_events_follow_batches() {
    let sink = RecordingSink::new();
    let graph = TaskGraph::new(vec![task("a", &[]), task("b", &["a"])]).unwrap();
    BatchDriver::new(Arc::new(executor(ScriptedService::new())))
        .with_sink(sink.clone())
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        sink.kinds(),
        vec![
            "run_started",
            "batch_started",
            "task_started",
            "task_completed",
            "batch_completed",
            "batch_started",
            "task_started",
            "task_completed",
            "batch_completed",
            "run_completed",
        ]
    );
}
