//! Cooperative cancellation of a run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orchestra::core::TaskGraph;
use orchestra::orchestration::{BatchDriver, ProgressEvent, ProgressSink, RunStatus};

use crate::fixtures::{executor, task, ScriptedService};

/// Cancels the token when the named task finishes.
struct CancelAfter {
    task_id: &'static str,
    token: CancellationToken,
    events: Mutex<Vec<&'static str>>,
}

impl ProgressSink for CancelAfter {
    fn emit(&self, event: ProgressEvent) {
        if matches!(&event, ProgressEvent::TaskCompleted { task_id, .. } if task_id == self.task_id)
        {
            self.token.cancel();
        }
        self.events.lock().unwrap().push(event.kind());
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_keeps_finished_batch() {
    let token = CancellationToken::new();
    let sink = Arc::new(CancelAfter {
        task_id: "fast",
        token: token.clone(),
        events: Mutex::new(Vec::new()),
    });
    let service = ScriptedService::with_delay(Duration::from_secs(1));
    let graph = TaskGraph::new(vec![
        task("fast", &[]),
        task("sibling", &[]),
        task("later", &["fast"]),
    ])
    .unwrap();

    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .with_sink(sink.clone())
        .run(&graph, &token)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    // In-flight work of the first batch is kept.
    assert!(report.result("fast").unwrap().is_success());
    assert!(report.result("sibling").unwrap().is_success());
    assert_eq!(report.not_started, vec!["later"]);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.cancelled, 1);
    assert!(service.requests_for("later", orchestra::orchestration::CallKind::Worker).is_empty());

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events.last(), Some(&"run_cancelled"));
    assert!(!events.contains(&"run_completed"));
}

#[tokio::test]
async fn test_cancelled_token_runs_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let service = ScriptedService::new();
    let graph = TaskGraph::new(vec![task("a", &[]), task("b", &["a"])]).unwrap();

    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &token)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(service.requests().is_empty());
    assert_eq!(report.not_started, vec!["a", "b"]);
    assert_eq!(report.cancelled, 2);
}
