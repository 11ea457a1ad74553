//! Outcome types produced while executing tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token counts reported by the reasoning service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}

/// Why a guarded call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model finished on its own.
    Normal,
    /// The tool-call limit was reached.
    CircuitBreaker,
    /// Output or tool calls started repeating.
    LoopDetected,
    /// The context could not be trimmed under the model window.
    TokenBudget,
}

impl Termination {
    /// Whether a guardrail, rather than the model, ended the call.
    pub fn is_guardrail(&self) -> bool {
        !matches!(self, Termination::Normal)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Normal => write!(f, "normal"),
            Termination::CircuitBreaker => write!(f, "circuit_breaker"),
            Termination::LoopDetected => write!(f, "loop_detected"),
            Termination::TokenBudget => write!(f, "token_budget"),
        }
    }
}

/// One quality-control verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcResult {
    pub passed: bool,
    /// 0-100.
    pub score: u8,
    pub feedback: String,
    pub issues: Vec<String>,
    pub required_fixes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl QcResult {
    pub fn new(
        passed: bool,
        score: u8,
        feedback: impl Into<String>,
        issues: Vec<String>,
        required_fixes: Vec<String>,
    ) -> Self {
        Self {
            passed,
            score: score.min(100),
            feedback: feedback.into(),
            issues,
            required_fixes,
            timestamp: Utc::now(),
        }
    }

    /// Conservative verdict used when a QC response cannot be parsed.
    pub fn malformed() -> Self {
        Self::new(
            false,
            0,
            "QC response could not be parsed; treating the output as unverified.",
            vec!["QC output was not in the expected format".to_string()],
            vec!["Produce output that clearly satisfies every verification criterion".to_string()],
        )
    }

    /// Verdict recorded when a guardrail stopped the worker before QC could run.
    pub fn from_termination(reason: Termination) -> Self {
        let issue = match reason {
            Termination::CircuitBreaker => "Worker exceeded its tool-call limit",
            Termination::LoopDetected => "Worker output became repetitive",
            Termination::TokenBudget => "Worker context exceeded the model window",
            Termination::Normal => "Worker stopped unexpectedly",
        };
        Self::new(
            false,
            0,
            format!("Worker call terminated by {}.", reason),
            vec![issue.to_string()],
            vec!["Reach a final answer directly without repeating steps".to_string()],
        )
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success => write!(f, "success"),
            TaskOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Everything recorded about one task's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: TaskOutcome,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub tokens: TokenUsage,
    pub tool_calls: usize,
    /// Latest QC verdict.
    pub qc_result: Option<QcResult>,
    pub qc_history: Vec<QcResult>,
    /// Number of worker invocations made.
    pub attempts: u32,
    pub terminated_by: Option<Termination>,
}

impl ExecutionResult {
    /// A result in its initial state, before any attempt.
    pub fn pending(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskOutcome::Failure,
            output: String::new(),
            error: None,
            duration_ms: 0,
            tokens: TokenUsage::default(),
            tool_calls: 0,
            qc_result: None,
            qc_history: Vec::new(),
            attempts: 0,
            terminated_by: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskOutcome::Success
    }

    /// Score of the latest QC verdict, if any.
    pub fn qc_score(&self) -> Option<u8> {
        self.qc_result.as_ref().map(|qc| qc.score)
    }
}
