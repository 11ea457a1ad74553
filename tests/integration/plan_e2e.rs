//! Plan files loaded and executed start to finish.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use orchestra::core::TaskGraph;
use orchestra::orchestration::{
    load_plan, parse_plan, BatchDriver, CallKind, PlanFormat, RunStatus,
};

use crate::fixtures::{executor, qc, RecordingSink, ScriptedService};

const PIPELINE: &str = r#"
# Release Pipeline

**Task ID:** task-1
**Title:** Setup
**Agent Role Description:** Build engineer
**Prompt:**
Prepare the build environment.
**Dependencies:** none
**QC Agent Role Description:** Release reviewer
**Verification Criteria:**
- toolchain pinned

---

**Task ID:** task-2
**Title:** Build
**Prompt:**
Compile every crate in release mode.
**Dependencies:** task-1
**QC Agent Role Description:** Release reviewer
**Verification Criteria:**
- no warnings

---

**Task ID:** task 3
**Title:** Test
**Prompt:**
Run the full test suite.
**Dependencies:** task 2
**QC Agent Role Description:** Release reviewer
**Max Retries:** 1
"#;

#[tokio::test]
async fn test_markdown_pipeline_runs_in_order() {
    let tasks = parse_plan(PIPELINE, PlanFormat::Markdown).unwrap();
    let graph = TaskGraph::new(tasks).unwrap();
    let service = ScriptedService::new();
    service.script(
        "task-2",
        CallKind::QualityControl,
        vec![qc(false, 62, &["Warnings in release build"]), qc(true, 90, &[])],
    );
    let sink = RecordingSink::new();

    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .with_sink(sink.clone())
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.batches.len(), 3);
    assert_eq!(service.worker_order(), vec!["task-1", "task-2", "task-3"]);
    assert_eq!(report.result("task-2").unwrap().attempts, 2);
    assert_eq!(report.result("task-3").unwrap().attempts, 1);

    let build = &service.requests_for("task-2", CallKind::Worker)[0];
    assert!(build.context[0].contains("output of task-1"));
    assert!(build.instructions.contains("Worker agent"));
    let setup = &service.requests_for("task-1", CallKind::Worker)[0];
    assert!(setup.instructions.contains("Build engineer"));

    let completed = sink
        .events()
        .iter()
        .filter(|e| e.kind() == "task_completed")
        .count();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn test_json_plan_file_with_failure_stops_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.json");
    std::fs::write(
        &path,
        r#"{"tasks": [
            {"id": "fetch", "title": "Fetch", "prompt": "Download the data.", "qcRole": "Reviewer", "maxRetries": 0},
            {"id": "report", "title": "Report", "prompt": "Summarise the data.", "dependsOn": ["fetch"]}
        ]}"#,
    )
    .unwrap();

    let service = ScriptedService::new();
    service.script(
        "fetch",
        CallKind::QualityControl,
        vec![qc(false, 20, &["Data is incomplete"])],
    );
    let graph = TaskGraph::new(load_plan(&path).unwrap()).unwrap();
    let report = BatchDriver::new(Arc::new(executor(service.clone())))
        .run(&graph, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].attempts, 1);
    assert!(report.failures[0].error.contains("Data is incomplete"));
    assert_eq!(report.not_started, vec!["report"]);
    assert!(report.to_string().contains("Failures:"));
}
