//! Guardrails stopping runaway worker calls inside a task run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use orchestra::core::{TaskOutcome, Termination};
use orchestra::orchestration::{CallKind, ToolCall, ToolRunner};
use orchestra::Result;

use crate::fixtures::{executor, reply, reviewed_task, task, tool_call, ScriptedService};

struct EchoTools;

#[async_trait]
impl ToolRunner for EchoTools {
    async fn run(&self, call: &ToolCall) -> Result<String> {
        Ok(format!("{} -> ok", call.arguments))
    }
}

#[tokio::test]
async fn test_tool_budget_trips_circuit_breaker_then_retries() {
    let service = ScriptedService::new();
    service.script(
        "scan",
        CallKind::Worker,
        vec![
            tool_call("reading", "read", json!({"path": "a.rs"})),
            tool_call("reading", "read", json!({"path": "b.rs"})),
            tool_call("reading", "read", json!({"path": "c.rs"})),
        ],
    );

    let result = executor(service.clone())
        .with_tools(Arc::new(EchoTools))
        .execute(&reviewed_task("scan", &[]).with_tool_budget(2), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.tool_calls, 2);
    assert!(result.terminated_by.is_none());
    assert_eq!(
        result.qc_history[0].issues,
        vec!["Worker exceeded its tool-call limit".to_string()]
    );
    // The stopped attempt never reached review.
    assert_eq!(service.requests_for("scan", CallKind::QualityControl).len(), 1);

    let rounds = service.requests_for("scan", CallKind::Worker);
    assert_eq!(rounds.len(), 4);
    assert!(rounds[1]
        .turns
        .iter()
        .any(|t| t.content.contains("a.rs") && t.content.contains("-> ok")));
}

#[tokio::test]
async fn test_identical_tool_calls_are_a_loop() {
    let service = ScriptedService::new();
    let same = || tool_call("", "search", json!({"query": "TODO"}));
    service.script(
        "hunt",
        CallKind::Worker,
        vec![same(), same(), same(), same(), same()],
    );

    let result = executor(service.clone())
        .execute(&task("hunt", &[]).with_max_retries(0), &[])
        .await;

    assert_eq!(result.status, TaskOutcome::Failure);
    assert_eq!(result.terminated_by, Some(Termination::LoopDetected));
    assert_eq!(result.tool_calls, 3);
    assert_eq!(service.requests_for("hunt", CallKind::Worker).len(), 4);
    assert!(result
        .error
        .unwrap()
        .contains("Worker output became repetitive"));
}

#[tokio::test]
async fn test_repetitive_text_is_a_loop() {
    let service = ScriptedService::new();
    let rambling = "Checking the configuration once more.\n".repeat(20);
    service.script("ramble", CallKind::Worker, vec![reply(&rambling)]);

    let result = executor(service.clone())
        .execute(&reviewed_task("ramble", &[]), &[])
        .await;

    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(result.output, "output of ramble");
    assert_eq!(
        result.qc_history[0].issues,
        vec!["Worker output became repetitive".to_string()]
    );
}
