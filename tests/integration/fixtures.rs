//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted reasoning service keyed by task id and call kind
//! - A progress sink that records every event
//! - Predefined task sets

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use orchestra::core::TaskDefinition;
use orchestra::orchestration::{
    CallKind, ExecutorSettings, ProgressEvent, ProgressSink, ReasoningService, RoundReply,
    RoundRequest, TaskExecutor, ToolCall,
};
use orchestra::{Error, Result};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(RoundReply),
    Fail(String),
}

/// Reasoning service that replays scripted responses per `(task, kind)`.
///
/// Unscripted worker calls answer `output of <task>`; unscripted QC calls
/// pass with score 95.
#[derive(Default)]
pub struct ScriptedService {
    scripts: Mutex<HashMap<(String, CallKind), VecDeque<Step>>>,
    requests: Mutex<Vec<RoundRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each round sleeps for `delay` before replying.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn script(&self, task_id: &str, kind: CallKind, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry((task_id.to_string(), kind))
            .or_default()
            .extend(steps);
    }

    pub fn requests(&self) -> Vec<RoundRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests of `kind` made for `task_id`, in order.
    pub fn requests_for(&self, task_id: &str, kind: CallKind) -> Vec<RoundRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.kind == kind && task_of(r).as_deref() == Some(task_id))
            .collect()
    }

    /// Order in which tasks made their first worker call.
    pub fn worker_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for request in self.requests() {
            if request.kind != CallKind::Worker {
                continue;
            }
            if let Some(id) = task_of(&request) {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
        }
        order
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for ScriptedService {
    async fn round(&self, request: &RoundRequest) -> Result<RoundReply> {
        self.requests.lock().unwrap().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let task = task_of(request).unwrap_or_default();
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(task.clone(), request.kind))
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Fail(message)) => Err(Error::AgentInvocation(message)),
            None => match request.kind {
                CallKind::Worker => Ok(RoundReply::text(format!("output of {}", task))),
                CallKind::QualityControl => Ok(RoundReply::text(verdict(true, 95, &[]))),
            },
        }
    }
}

/// Task id named in the first user turn of a worker or QC request.
pub fn task_of(request: &RoundRequest) -> Option<String> {
    let prompt = &request.turns.first()?.content;
    if let Some(rest) = prompt.split("- Task ID: ").nth(1) {
        return rest.lines().next().map(|s| s.trim().to_string());
    }
    let rest = prompt.strip_prefix("Review the output of task ")?;
    rest.split(" (").next().map(|s| s.to_string())
}

/// A fenced JSON QC verdict.
pub fn verdict(passed: bool, score: u8, issues: &[&str]) -> String {
    let body = serde_json::json!({
        "passed": passed,
        "score": score,
        "feedback": if passed { "Looks complete." } else { "Needs work." },
        "issues": issues,
        "requiredFixes": issues.iter().map(|i| format!("Fix: {}", i)).collect::<Vec<_>>(),
    });
    format!("Review complete.\n\n```json\n{}\n```", body)
}

pub fn reply(text: &str) -> Step {
    Step::Reply(RoundReply::text(text))
}

pub fn qc(passed: bool, score: u8, issues: &[&str]) -> Step {
    Step::Reply(RoundReply::text(verdict(passed, score, issues)))
}

pub fn tool_call(text: &str, name: &str, args: serde_json::Value) -> Step {
    Step::Reply(RoundReply::text(text).with_tool_call(ToolCall::new(name, args)))
}

/// Records every progress event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ProgressEvent::kind).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A task whose prompt names its id.
pub fn task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition::new(id, &format!("Complete {}.", id))
        .with_title(&format!("Task {}", id))
        .with_dependencies(deps.iter().copied())
}

/// A task reviewed by a QC role.
pub fn reviewed_task(id: &str, deps: &[&str]) -> TaskDefinition {
    task(id, deps).with_qc("Reviewer", Some("The output must be complete."))
}

/// Diamond: a -> {b, c} -> d.
pub fn diamond_tasks() -> Vec<TaskDefinition> {
    vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
    ]
}

pub fn executor(service: Arc<ScriptedService>) -> TaskExecutor {
    TaskExecutor::new(service, ExecutorSettings::default())
}
