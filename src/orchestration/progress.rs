//! Progress events emitted by the batch driver.
//!
//! Events are emitted synchronously in execution order. Sinks must not
//! block; the channel sink uses an unbounded sender for that reason.

use crate::core::TaskOutcome;
use crate::{olog, olog_warn};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::sync::mpsc;

/// Finished and total task counts at the time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub finished: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        total_tasks: usize,
        total_batches: usize,
    },
    BatchStarted {
        batch: usize,
        task_ids: Vec<String>,
        progress: Progress,
        elapsed_ms: u64,
    },
    TaskStarted {
        task_id: String,
        batch: usize,
        progress: Progress,
        elapsed_ms: u64,
    },
    TaskCompleted {
        task_id: String,
        attempts: u32,
        duration_ms: u64,
        progress: Progress,
        elapsed_ms: u64,
    },
    TaskFailed {
        task_id: String,
        attempts: u32,
        duration_ms: u64,
        error: Option<String>,
        progress: Progress,
        elapsed_ms: u64,
    },
    BatchCompleted {
        batch: usize,
        succeeded: usize,
        failed: usize,
        progress: Progress,
        elapsed_ms: u64,
    },
    RunCompleted {
        succeeded: usize,
        failed: usize,
        not_started: usize,
        progress: Progress,
        elapsed_ms: u64,
    },
    RunCancelled {
        progress: Progress,
        elapsed_ms: u64,
    },
}

impl ProgressEvent {
    /// Task id for task-level events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ProgressEvent::TaskStarted { task_id, .. }
            | ProgressEvent::TaskCompleted { task_id, .. }
            | ProgressEvent::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Snake-case event name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::RunStarted { .. } => "run_started",
            ProgressEvent::BatchStarted { .. } => "batch_started",
            ProgressEvent::TaskStarted { .. } => "task_started",
            ProgressEvent::TaskCompleted { .. } => "task_completed",
            ProgressEvent::TaskFailed { .. } => "task_failed",
            ProgressEvent::BatchCompleted { .. } => "batch_completed",
            ProgressEvent::RunCompleted { .. } => "run_completed",
            ProgressEvent::RunCancelled { .. } => "run_cancelled",
        }
    }

    pub(crate) fn task_finished(
        task_id: &str,
        outcome: TaskOutcome,
        attempts: u32,
        duration_ms: u64,
        error: Option<String>,
        progress: Progress,
        elapsed_ms: u64,
    ) -> Self {
        match outcome {
            TaskOutcome::Success => ProgressEvent::TaskCompleted {
                task_id: task_id.to_string(),
                attempts,
                duration_ms,
                progress,
                elapsed_ms,
            },
            TaskOutcome::Failure => ProgressEvent::TaskFailed {
                task_id: task_id.to_string(),
                attempts,
                duration_ms,
                error,
                progress,
                elapsed_ms,
            },
        }
    }
}

/// Receives progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // Receiver gone means nobody is listening.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Writes events to the log file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::TaskFailed { task_id, error, .. } => {
                olog_warn!(
                    "Progress: task {} failed: {}",
                    task_id,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            other => match other.task_id() {
                Some(id) => olog!("Progress: {} {}", other.kind(), id),
                None => olog!("Progress: {}", other.kind()),
            },
        }
    }
}

/// Prints one JSON object per line to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSink;

impl ProgressSink for JsonLinesSink {
    fn emit(&self, event: ProgressEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
            }
            Err(e) => olog_warn!("Progress: failed to serialize {}: {}", event.kind(), e),
        }
    }
}
