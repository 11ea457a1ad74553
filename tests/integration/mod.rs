//! Integration test suite for orchestra.
//!
//! These tests drive whole task graphs through the batch driver, the task
//! state machine, the call guardrail and the admission queues together.
//!
//! # Test Categories
//!
//! - `scheduling`: Batch ordering and parallelism within a batch
//! - `execution`: Worker, QC and retry behaviour end to end
//! - `guardrails`: Tool-call limits and loop detection inside a run
//! - `admission`: Provider quotas spreading calls across windows
//! - `cancellation`: Cooperative cancellation between batches
//! - `plan_e2e`: Plan files loaded and executed start to finish
//!
//! # CI Compatibility
//!
//! These tests use a scripted reasoning service and a paused clock; they
//! make no network calls and do not sleep in real time.

mod fixtures;

mod admission;
mod cancellation;
mod execution;
mod guardrails;
mod plan_e2e;
mod scheduling;
