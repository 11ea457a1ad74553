//! Per-task worker, quality-control and retry state machine.
//!
//! A task runs as:
//!
//! ```text
//! pending -> worker_running -> qc_running -> passed
//!                 ^                 |
//!                 +---- retry <-----+---> exhausted -> failed_terminal
//! ```
//!
//! The QC step is skipped when the task has no QC role. A failed verdict
//! retries the worker with the reviewer's issues and fixes appended to the
//! prompt until `max_retries + 1` worker calls have been made. A worker call
//! stopped by a guardrail counts as a failed verdict. Service errors end the
//! task at once and are never retried here.

use crate::core::{ExecutionResult, QcResult, TaskDefinition, TaskOutcome, DEFAULT_MAX_RETRIES};
use crate::error::{Error, Result};
use crate::orchestration::admission::AdmissionRegistry;
use crate::orchestration::guardrail::{CallGuardrail, GuardedCall, GuardedOutcome, GuardrailConfig};
use crate::orchestration::instructions::{InstructionResolver, Memoized, RoleTemplates};
use crate::orchestration::qc::{parse_qc_output, qc_prompt, DEFAULT_PASS_SCORE};
use crate::orchestration::service::{CallKind, NoTools, ReasoningService, ToolRunner};
use crate::{olog, olog_debug, olog_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default model for worker and QC calls.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// States a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    WorkerRunning,
    QcRunning,
    Retry,
    Passed,
    Exhausted,
    FailedTerminal,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Passed | TaskState::FailedTerminal)
    }

    fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, WorkerRunning)
                | (WorkerRunning, QcRunning)
                | (WorkerRunning, Passed)
                | (WorkerRunning, Retry)
                | (WorkerRunning, Exhausted)
                | (WorkerRunning, FailedTerminal)
                | (QcRunning, Passed)
                | (QcRunning, Retry)
                | (QcRunning, Exhausted)
                | (QcRunning, FailedTerminal)
                | (Retry, WorkerRunning)
                | (Exhausted, FailedTerminal)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::WorkerRunning => "worker_running",
            TaskState::QcRunning => "qc_running",
            TaskState::Retry => "retry",
            TaskState::Passed => "passed",
            TaskState::Exhausted => "exhausted",
            TaskState::FailedTerminal => "failed_terminal",
        };
        write!(f, "{}", name)
    }
}

/// Tracks and validates one task's state transitions.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task_id: String,
    state: TaskState,
    history: Vec<TaskState>,
}

impl TaskStateMachine {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: TaskState::Pending,
            history: vec![TaskState::Pending],
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// States visited, in order, starting with `pending`.
    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns `Error::InvalidStateTransition` if the move is not allowed.
    pub fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        olog_debug!("Task {}: {} -> {}", self.task_id, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Runtime settings for task execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub worker_model: String,
    pub qc_model: String,
    pub qc_pass_score: u8,
    /// Retries for tasks that do not set their own.
    pub default_max_retries: u32,
    pub guardrail: GuardrailConfig,
    /// Wall-clock limit per task; `None` disables it.
    pub task_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            worker_model: DEFAULT_MODEL.to_string(),
            qc_model: DEFAULT_MODEL.to_string(),
            qc_pass_score: DEFAULT_PASS_SCORE,
            default_max_retries: DEFAULT_MAX_RETRIES,
            guardrail: GuardrailConfig::default(),
            task_timeout: None,
        }
    }
}

/// Output of a finished upstream task, handed to its dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyOutput {
    pub task_id: String,
    pub title: String,
    pub output: String,
}

impl DependencyOutput {
    fn as_context(&self) -> String {
        format!(
            "Output of dependency {} ({}):\n{}",
            self.task_id, self.title, self.output
        )
    }
}

/// Runs one task to a terminal result.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &TaskDefinition, deps: &[DependencyOutput]) -> ExecutionResult;
}

/// The production [`TaskRunner`]: guarded calls through the admission queue.
pub struct TaskExecutor {
    service: Arc<dyn ReasoningService>,
    tools: Arc<dyn ToolRunner>,
    resolver: Arc<dyn InstructionResolver>,
    admission: Arc<AdmissionRegistry>,
    guardrail: CallGuardrail,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    /// Executor with no tools, memoized template instructions and no quota.
    pub fn new(service: Arc<dyn ReasoningService>, settings: ExecutorSettings) -> Self {
        Self {
            service,
            tools: Arc::new(NoTools),
            resolver: Arc::new(Memoized::new(RoleTemplates)),
            admission: Arc::new(AdmissionRegistry::unlimited()),
            guardrail: CallGuardrail::new(settings.guardrail.clone()),
            settings,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRunner>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn InstructionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionRegistry>) -> Self {
        self.admission = admission;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run `task` to a terminal result. Never returns an error; failures are
    /// recorded in the result.
    pub async fn execute(&self, task: &TaskDefinition, deps: &[DependencyOutput]) -> ExecutionResult {
        let started = Instant::now();
        let mut result = ExecutionResult::pending(&task.id);
        olog!("Task {} started: {}", task.id, task.title);

        let outcome = match self.settings.task_timeout {
            Some(limit) => tokio::time::timeout(limit, self.drive(task, deps, &mut result))
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => self.drive(task, deps, &mut result).await,
        };

        if let Err(e) = outcome {
            olog_warn!("Task {} failed terminally: {}", task.id, e);
            result.status = TaskOutcome::Failure;
            result.error = Some(e.to_string());
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        olog!(
            "Task {} finished: {} after {} attempt(s) in {}ms",
            task.id,
            result.status,
            result.attempts,
            result.duration_ms
        );
        result
    }

    async fn drive(
        &self,
        task: &TaskDefinition,
        deps: &[DependencyOutput],
        result: &mut ExecutionResult,
    ) -> Result<()> {
        let mut machine = TaskStateMachine::new(&task.id);
        let max_attempts = task.max_attempts(self.settings.default_max_retries);
        let worker_model = task
            .model
            .clone()
            .unwrap_or_else(|| self.settings.worker_model.clone());
        let context: Vec<String> = deps.iter().map(DependencyOutput::as_context).collect();

        loop {
            machine.advance(TaskState::WorkerRunning)?;
            result.attempts += 1;

            let worker = self
                .guarded(
                    &mut machine,
                    &task.role,
                    CallKind::Worker,
                    &worker_model,
                    context.clone(),
                    worker_prompt(
                        task,
                        deps,
                        result.attempts,
                        max_attempts,
                        result.qc_result.as_ref(),
                    ),
                    self.settings.guardrail.tool_limit_for(task.tool_call_budget),
                )
                .await?;
            result.tokens += worker.tokens;
            result.tool_calls += worker.tool_calls;
            result.output = worker.output;

            let verdict = if worker.terminated_by.is_guardrail() {
                result.terminated_by = Some(worker.terminated_by);
                QcResult::from_termination(worker.terminated_by)
            } else {
                result.terminated_by = None;
                let Some(qc_role) = task.qc_role.as_deref() else {
                    machine.advance(TaskState::Passed)?;
                    result.status = TaskOutcome::Success;
                    return Ok(());
                };

                machine.advance(TaskState::QcRunning)?;
                let qc = self
                    .guarded(
                        &mut machine,
                        qc_role,
                        CallKind::QualityControl,
                        &self.settings.qc_model,
                        Vec::new(),
                        qc_prompt(task, &result.output),
                        self.settings.guardrail.tool_call_limit,
                    )
                    .await?;
                result.tokens += qc.tokens;
                result.tool_calls += qc.tool_calls;
                if qc.terminated_by.is_guardrail() {
                    olog_warn!(
                        "Task {}: QC call stopped by {}; parsing partial output",
                        task.id,
                        qc.terminated_by
                    );
                }
                parse_qc_output(&qc.output, self.settings.qc_pass_score)
            };

            let passed = verdict.passed;
            olog_debug!(
                "Task {} attempt {}: passed={} score={}",
                task.id,
                result.attempts,
                passed,
                verdict.score
            );
            result.qc_history.push(verdict.clone());
            result.qc_result = Some(verdict);

            if passed {
                machine.advance(TaskState::Passed)?;
                result.status = TaskOutcome::Success;
                return Ok(());
            }
            if result.attempts < max_attempts {
                machine.advance(TaskState::Retry)?;
                continue;
            }

            machine.advance(TaskState::Exhausted)?;
            machine.advance(TaskState::FailedTerminal)?;
            result.status = TaskOutcome::Failure;
            result.error = Some(failure_report(task, &result.qc_history));
            return Ok(());
        }
    }

    /// One guarded call; service errors move the machine to its terminal state.
    #[allow(clippy::too_many_arguments)]
    async fn guarded(
        &self,
        machine: &mut TaskStateMachine,
        role: &str,
        kind: CallKind,
        model: &str,
        context: Vec<String>,
        prompt: String,
        tool_call_limit: usize,
    ) -> Result<GuardedOutcome> {
        let call = async {
            let instructions = self.resolver.resolve(role, kind).await?;
            let queue = self.admission.queue_for_model(model);
            self.guardrail
                .run(
                    self.service.as_ref(),
                    self.tools.as_ref(),
                    &queue,
                    GuardedCall {
                        model: model.to_string(),
                        kind,
                        instructions,
                        context,
                        prompt,
                        tool_call_limit,
                    },
                )
                .await
        };
        match call.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                machine.advance(TaskState::FailedTerminal)?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TaskRunner for TaskExecutor {
    async fn run_task(&self, task: &TaskDefinition, deps: &[DependencyOutput]) -> ExecutionResult {
        self.execute(task, deps).await
    }
}

/// Compose the worker prompt for an attempt.
///
/// From the second attempt on, the previous verdict is appended as an
/// itemised feedback block.
pub fn worker_prompt(
    task: &TaskDefinition,
    deps: &[DependencyOutput],
    attempt: u32,
    max_attempts: u32,
    previous: Option<&QcResult>,
) -> String {
    let dependencies = if task.dependencies.is_empty() {
        "none".to_string()
    } else {
        task.dependencies.join(", ")
    };
    let mut prompt = format!(
        "{}\n\n## Task Context\n- Task ID: {}\n- Title: {}\n- Attempt: {} of {}\n- Dependencies: {}",
        task.prompt.trim(),
        task.id,
        task.title,
        attempt,
        max_attempts,
        dependencies
    );
    if !deps.is_empty() {
        prompt.push_str("\n- Dependency outputs are provided as context.");
    }

    if let Some(qc) = previous {
        prompt.push_str(&format!(
            "\n\n## Previous Attempt Feedback\nThe previous attempt scored {}/100 and did not pass review.",
            qc.score
        ));
        push_items(&mut prompt, "Issues", &qc.issues);
        push_items(&mut prompt, "Required Fixes", &qc.required_fixes);
        if !qc.feedback.trim().is_empty() {
            prompt.push_str(&format!("\n\n### Reviewer Feedback\n{}", qc.feedback.trim()));
        }
        prompt.push_str("\n\nAddress every issue and required fix listed above.");
    }
    prompt
}

fn push_items(prompt: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    prompt.push_str(&format!("\n\n### {}", heading));
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("\n{}. {}", i + 1, item));
    }
}

/// Summary of every attempt for a task that exhausted its retries.
pub fn failure_report(task: &TaskDefinition, history: &[QcResult]) -> String {
    let mut report = format!(
        "Task {} failed quality control after {} attempt(s).",
        task.id,
        history.len()
    );
    for (i, qc) in history.iter().enumerate() {
        let issues = if qc.issues.is_empty() {
            qc.feedback.clone()
        } else {
            qc.issues.join("; ")
        };
        report.push_str(&format!(
            "\nAttempt {}: score {}: {}",
            i + 1,
            qc.score,
            issues
        ));
    }
    report
}
