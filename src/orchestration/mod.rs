//! Orchestration layer: drives a task graph through worker and
//! quality-control calls.
//!
//! The [`BatchDriver`] runs scheduled batches, handing each task to a
//! [`TaskRunner`] (normally a [`TaskExecutor`]). Every model call goes
//! through the [`CallGuardrail`] and waits for admission from the
//! provider's [`AdmissionQueue`].

pub mod admission;
pub mod command;
pub mod driver;
pub mod executor;
pub mod guardrail;
pub mod instructions;
pub mod plan;
pub mod progress;
pub mod qc;
pub mod report;
pub mod service;

pub use admission::{AdmissionMetrics, AdmissionQueue, AdmissionRegistry, RequestLimit};
pub use command::CommandService;
pub use driver::BatchDriver;
pub use executor::{
    DependencyOutput, ExecutorSettings, TaskExecutor, TaskRunner, TaskState, TaskStateMachine,
};
pub use guardrail::{CallGuardrail, GuardedCall, GuardedOutcome, GuardrailConfig};
pub use instructions::{InstructionResolver, Memoized, RoleTemplates};
pub use plan::{load_plan, parse_plan, PlanFormat};
pub use progress::{JsonLinesSink, LogSink, NullSink, Progress, ProgressEvent, ProgressSink};
pub use qc::parse_qc_output;
pub use report::{FailureEntry, RunReport, RunStatus};
pub use service::{
    CallKind, NoTools, ReasoningService, RoundReply, RoundRequest, ToolCall, ToolRunner, Turn,
    TurnRole,
};
