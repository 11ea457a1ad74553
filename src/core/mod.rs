//! Core domain models for orchestration.
//!
//! This module contains the task definitions, the dependency graph that
//! schedules them into batches, and the result types produced by execution.

pub mod dag;
pub mod result;
pub mod task;

pub use dag::{ExecutionPlan, TaskGraph};
pub use result::{ExecutionResult, QcResult, TaskOutcome, Termination, TokenUsage};
pub use task::{TaskDefinition, DEFAULT_MAX_RETRIES, DEFAULT_QC_ROLE};
