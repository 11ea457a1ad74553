//! Worker, QC and retry behaviour through the full executor.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orchestra::core::{TaskGraph, TaskOutcome};
use orchestra::orchestration::{BatchDriver, CallKind, ExecutorSettings, RunStatus, TaskExecutor};

use crate::fixtures::{executor, qc, reply, reviewed_task, task, ScriptedService, Step};

#[tokio::test]
async fn test_failed_review_feeds_issues_into_retry() {
    let service = ScriptedService::new();
    service.script(
        "docs",
        CallKind::Worker,
        vec![reply("draft without examples"), reply("draft with examples")],
    );
    service.script(
        "docs",
        CallKind::QualityControl,
        vec![qc(false, 55, &["No usage examples"]), qc(true, 91, &[])],
    );

    let result = executor(service.clone())
        .execute(&reviewed_task("docs", &[]), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.output, "draft with examples");
    assert_eq!(result.qc_history.len(), 2);
    assert_eq!(result.qc_score(), Some(91));

    let prompts = service.requests_for("docs", CallKind::Worker);
    let retry_prompt = &prompts[1].turns[0].content;
    assert!(retry_prompt.contains("Attempt: 2 of 3"));
    assert!(retry_prompt.contains("1. No usage examples"));
    assert!(retry_prompt.contains("1. Fix: No usage examples"));
    assert!(!prompts[0].turns[0].content.contains("Previous Attempt Feedback"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_report() {
    let service = ScriptedService::new();
    service.script(
        "api",
        CallKind::QualityControl,
        vec![
            qc(false, 40, &["Missing auth"]),
            qc(false, 60, &["Missing rate limit"]),
        ],
    );

    let result = executor(service.clone())
        .execute(&reviewed_task("api", &[]).with_max_retries(1), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Failure);
    assert_eq!(result.attempts, 2);
    let error = result.error.unwrap();
    assert!(error.contains("failed quality control after 2 attempt(s)"));
    assert!(error.contains("Missing auth"));
    assert!(error.contains("Missing rate limit"));
    assert_eq!(service.requests_for("api", CallKind::Worker).len(), 2);
}

#[tokio::test]
async fn test_configured_default_retries_apply() {
    let service = ScriptedService::new();
    service.script(
        "strict",
        CallKind::QualityControl,
        vec![qc(false, 10, &["wrong"]); 5],
    );
    let settings = ExecutorSettings {
        default_max_retries: 4,
        ..ExecutorSettings::default()
    };

    let result = TaskExecutor::new(service.clone(), settings)
        .execute(&reviewed_task("strict", &[]), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Failure);
    assert_eq!(result.attempts, 5);
}

#[tokio::test]
async fn test_unparseable_review_counts_as_failure() {
    let service = ScriptedService::new();
    service.script(
        "vague",
        CallKind::QualityControl,
        vec![reply("It seems fine I guess"), qc(true, 88, &[])],
    );

    let result = executor(service.clone())
        .execute(&reviewed_task("vague", &[]), &[])
        .await;

    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert!(!result.qc_history[0].passed);
    assert_eq!(result.qc_history[0].score, 0);
}

#[tokio::test]
async fn test_service_error_is_terminal_without_retry() {
    let service = ScriptedService::new();
    service.script(
        "flaky",
        CallKind::Worker,
        vec![Step::Fail("connection reset".to_string())],
    );

    let result = executor(service.clone())
        .execute(&reviewed_task("flaky", &[]), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Failure);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("connection reset"));
    assert!(service.requests_for("flaky", CallKind::QualityControl).is_empty());
}

#[tokio::test]
async fn test_dependency_outputs_reach_dependents_as_context() {
    let service = ScriptedService::new();
    service.script("schema", CallKind::Worker, vec![reply("CREATE TABLE users")]);
    let graph = TaskGraph::new(vec![task("schema", &[]), task("queries", &["schema"])]).unwrap();

    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let request = &service.requests_for("queries", CallKind::Worker)[0];
    assert_eq!(request.context.len(), 1);
    assert!(request.context[0].contains("CREATE TABLE users"));
    assert!(request.context[0].contains("schema"));
    assert!(service.requests_for("schema", CallKind::Worker)[0]
        .context
        .is_empty());
}

#[tokio::test]
async fn test_failure_blocks_dependents_but_not_siblings() {
    let service = ScriptedService::new();
    service.script(
        "b",
        CallKind::Worker,
        vec![Step::Fail("provider unavailable".to_string())],
    );
    let graph = TaskGraph::new(vec![
        task("a", &[]),
        task("b", &[]),
        task("c", &["a"]),
        task("d", &["b"]),
    ])
    .unwrap();

    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .with_fail_fast(false)
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.result("c").unwrap().is_success());
    assert_eq!(report.not_started, vec!["d"]);
    assert_eq!(report.cancelled, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task_id, "b");
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_fails_the_task() {
    let service = ScriptedService::with_delay(Duration::from_secs(120));
    let settings = ExecutorSettings {
        task_timeout: Some(Duration::from_secs(30)),
        ..ExecutorSettings::default()
    };

    let result = TaskExecutor::new(service, settings)
        .execute(&task("slow", &[]), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Failure);
    assert!(result.error.unwrap().contains("30"));
}
