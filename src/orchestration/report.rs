//! Final run report.

use crate::core::{ExecutionResult, TaskGraph};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task succeeded.
    Completed,
    /// At least one task failed.
    Failed,
    /// Cancellation was observed before the run finished.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One line of the failure list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub task_id: String,
    pub title: String,
    pub duration_ms: u64,
    pub error: String,
    pub attempts: u32,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks never started because the run was cancelled; 0 otherwise.
    pub cancelled: usize,
    /// Tasks never started (fail-fast, cancellation, or a failed upstream).
    pub not_started: Vec<String>,
    pub duration_ms: u64,
    pub batches: Vec<Vec<String>>,
    /// Results in completion order by batch.
    pub results: Vec<ExecutionResult>,
    /// Present whenever a task failed or the run was cancelled.
    pub failures: Vec<FailureEntry>,
}

impl RunReport {
    /// Assemble a report from the results gathered by the driver.
    pub(crate) fn build(
        run_id: String,
        started_at: DateTime<Utc>,
        graph: &TaskGraph,
        batches: Vec<Vec<String>>,
        results: Vec<ExecutionResult>,
        was_cancelled: bool,
        duration_ms: u64,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let not_started: Vec<String> = batches
            .iter()
            .flatten()
            .filter(|id| !results.iter().any(|r| &r.task_id == *id))
            .cloned()
            .collect();
        let failures = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| FailureEntry {
                task_id: r.task_id.clone(),
                title: graph
                    .get_task(&r.task_id)
                    .map(|t| t.title.clone())
                    .unwrap_or_default(),
                duration_ms: r.duration_ms,
                error: r
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
                attempts: r.attempts,
            })
            .collect();
        let status = if was_cancelled {
            RunStatus::Cancelled
        } else if failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let cancelled = if was_cancelled { not_started.len() } else { 0 };

        Self {
            run_id,
            started_at,
            status,
            total: graph.task_count(),
            succeeded,
            failed,
            cancelled,
            not_started,
            duration_ms,
            batches,
            results,
            failures,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn result(&self, task_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    /// Whether the itemised failure list applies.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.status == RunStatus::Cancelled
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} {}", self.run_id, self.status)?;
        writeln!(
            f,
            "  {} succeeded, {} failed, {} cancelled, {} not started of {} tasks in {:.1}s",
            self.succeeded,
            self.failed,
            self.cancelled,
            self.not_started.len(),
            self.total,
            self.duration_ms as f64 / 1000.0
        )?;

        writeln!(f, "\nBatches:")?;
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, batch.join(", "))?;
        }

        writeln!(f, "\nTasks:")?;
        for result in &self.results {
            let qc = result
                .qc_score()
                .map(|s| format!(", qc {}", s))
                .unwrap_or_default();
            writeln!(
                f,
                "  [{}] {} ({}ms, {} attempt(s){})",
                if result.is_success() { "ok" } else { "FAIL" },
                result.task_id,
                result.duration_ms,
                result.attempts,
                qc
            )?;
        }

        if self.has_failures() {
            writeln!(f, "\nFailures:")?;
            if self.failures.is_empty() {
                writeln!(f, "  none; run cancelled before completion")?;
            }
            for failure in &self.failures {
                writeln!(
                    f,
                    "  - {} \"{}\" after {} attempt(s), {}ms",
                    failure.task_id, failure.title, failure.attempts, failure.duration_ms
                )?;
                for line in failure.error.lines() {
                    writeln!(f, "      {}", line)?;
                }
            }
            if !self.not_started.is_empty() {
                writeln!(f, "  not started: {}", self.not_started.join(", "))?;
            }
        }
        Ok(())
    }
}
