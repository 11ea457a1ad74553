pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use crate::core::{ExecutionResult, QcResult, TaskDefinition, TaskGraph, TaskOutcome, Termination};
pub use error::{Error, Result};
pub use orchestration::{BatchDriver, RunReport, TaskExecutor};
