//! Batch driver: runs the scheduled batches in order.
//!
//! Every task in a batch is launched together and awaited together; batch
//! `N + 1` never starts before every task in batch `N` is terminal.
//!
//! Cancellation is cooperative. The token is checked before each batch and
//! before each task launch. In-flight calls are not interrupted; they finish
//! on their own or when a guardrail stops them, and their results are kept.

use crate::core::{ExecutionResult, TaskGraph};
use crate::error::Result;
use crate::orchestration::executor::{DependencyOutput, TaskRunner};
use crate::orchestration::progress::{NullSink, Progress, ProgressEvent, ProgressSink};
use crate::orchestration::report::RunReport;
use crate::{olog, olog_debug, olog_warn};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct BatchDriver {
    runner: Arc<dyn TaskRunner>,
    sink: Arc<dyn ProgressSink>,
    fail_fast: bool,
}

impl BatchDriver {
    /// Driver with fail-fast on and no progress sink.
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            sink: Arc::new(NullSink),
            fail_fast: true,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// With fail-fast off, later batches still run but tasks downstream of a
    /// failure are skipped.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Schedule and run `graph`.
    ///
    /// # Errors
    /// Returns `Error::CycleDetected` before anything runs if the graph has a
    /// cycle. Task failures are reported in the [`RunReport`], not as errors.
    pub async fn run(&self, graph: &TaskGraph, cancel: &CancellationToken) -> Result<RunReport> {
        let plan = graph.batches()?;
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let total = graph.task_count();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        olog!(
            "Run {} started: {} tasks in {} batches",
            run_id,
            total,
            plan.len()
        );
        self.sink.emit(ProgressEvent::RunStarted {
            run_id: run_id.clone(),
            total_tasks: total,
            total_batches: plan.len(),
        });

        let finished = AtomicUsize::new(0);
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(total);
        let mut outputs: HashMap<String, DependencyOutput> = HashMap::new();
        // Failed or never-started tasks; their dependents cannot run.
        let mut blocked: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        for (index, batch) in plan.batches().iter().enumerate() {
            let batch_no = index + 1;
            if cancel.is_cancelled() {
                olog_warn!("Run {}: cancelled before batch {}", run_id, batch_no);
                cancelled = true;
                break;
            }

            self.sink.emit(ProgressEvent::BatchStarted {
                batch: batch_no,
                task_ids: batch.clone(),
                progress: progress(&finished, total),
                elapsed_ms: elapsed_ms(),
            });

            let mut launched = Vec::with_capacity(batch.len());
            for id in batch {
                if cancel.is_cancelled() {
                    olog_warn!("Run {}: cancelled during launch of batch {}", run_id, batch_no);
                    cancelled = true;
                    break;
                }
                let Some(task) = graph.get_task(id) else {
                    continue;
                };
                if let Some(dep) = task.dependencies.iter().find(|d| blocked.contains(*d)) {
                    olog_warn!("Run {}: skipping {} because {} did not succeed", run_id, id, dep);
                    blocked.insert(id.clone());
                    continue;
                }

                let deps: Vec<DependencyOutput> = task
                    .dependencies
                    .iter()
                    .filter_map(|d| outputs.get(d).cloned())
                    .collect();
                self.sink.emit(ProgressEvent::TaskStarted {
                    task_id: id.clone(),
                    batch: batch_no,
                    progress: progress(&finished, total),
                    elapsed_ms: elapsed_ms(),
                });

                let runner = &self.runner;
                let sink = &self.sink;
                let finished = &finished;
                launched.push(async move {
                    let result = runner.run_task(task, &deps).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    sink.emit(ProgressEvent::task_finished(
                        &result.task_id,
                        result.status,
                        result.attempts,
                        result.duration_ms,
                        result.error.clone(),
                        progress(finished, total),
                        elapsed_ms(),
                    ));
                    result
                });
            }

            let batch_results = join_all(launched).await;
            let failed = batch_results.iter().filter(|r| !r.is_success()).count();
            let succeeded = batch_results.len() - failed;
            for result in batch_results {
                if result.is_success() {
                    if let Some(task) = graph.get_task(&result.task_id) {
                        outputs.insert(
                            result.task_id.clone(),
                            DependencyOutput {
                                task_id: result.task_id.clone(),
                                title: task.title.clone(),
                                output: result.output.clone(),
                            },
                        );
                    }
                } else {
                    blocked.insert(result.task_id.clone());
                }
                results.push(result);
            }
            olog_debug!(
                "Run {}: batch {} done ({} ok, {} failed)",
                run_id,
                batch_no,
                succeeded,
                failed
            );
            self.sink.emit(ProgressEvent::BatchCompleted {
                batch: batch_no,
                succeeded,
                failed,
                progress: progress(&finished, total),
                elapsed_ms: elapsed_ms(),
            });

            if cancelled {
                break;
            }
            if failed > 0 && self.fail_fast {
                olog_warn!(
                    "Run {}: {} task(s) failed in batch {}; not starting later batches",
                    run_id,
                    failed,
                    batch_no
                );
                break;
            }
        }

        let duration_ms = elapsed_ms();
        let report = RunReport::build(
            run_id,
            started_at,
            graph,
            plan.batches().to_vec(),
            results,
            cancelled,
            duration_ms,
        );

        if cancelled {
            self.sink.emit(ProgressEvent::RunCancelled {
                progress: progress(&finished, total),
                elapsed_ms: duration_ms,
            });
        } else {
            self.sink.emit(ProgressEvent::RunCompleted {
                succeeded: report.succeeded,
                failed: report.failed,
                not_started: report.not_started.len(),
                progress: progress(&finished, total),
                elapsed_ms: duration_ms,
            });
        }
        olog!(
            "Run {} {}: {} succeeded, {} failed, {} cancelled, {} not started",
            report.run_id,
            report.status,
            report.succeeded,
            report.failed,
            report.cancelled,
            report.not_started.len()
        );
        Ok(report)
    }
}

fn progress(finished: &AtomicUsize, total: usize) -> Progress {
    Progress {
        finished: finished.load(Ordering::SeqCst),
        total,
    }
}
