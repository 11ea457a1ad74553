//! Task definitions for the execution graph.
//!
//! A `TaskDefinition` is one unit of delegated work: the prompt handed to a
//! worker, the role it should play, the tasks it waits on, and the optional
//! quality-control step that validates its output. Definitions are immutable
//! once scheduling begins.

use serde::{Deserialize, Deserializer, Serialize};

/// Default number of retries after a failed QC verdict.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Worker role used when a plan does not name one.
pub const DEFAULT_WORKER_ROLE: &str = "Worker agent";

/// QC role given to markdown plan tasks that do not name one.
pub const DEFAULT_QC_ROLE: &str = "QC agent";

/// Verification criteria used when a QC role is set but no criteria are given.
pub const DEFAULT_VERIFICATION_CRITERIA: &str = "Verify the output meets all task requirements.";

fn default_worker_role() -> String {
    DEFAULT_WORKER_ROLE.to_string()
}

/// A single task in a plan.
///
/// Structured plans may use either snake_case or the camelCase names the
/// upstream planner emits (`dependsOn`, `parallelGroup`, `qcRole`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique identifier within the plan.
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Role description handed to the worker.
    #[serde(
        default = "default_worker_role",
        alias = "workerRole",
        alias = "worker_role",
        alias = "agentRoleDescription"
    )]
    pub role: String,
    /// Recommended model identifier; the executor default applies when unset.
    #[serde(default, alias = "recommendedModel", alias = "recommended_model")]
    pub model: Option<String>,
    /// Prompt text for the worker.
    #[serde(default)]
    pub prompt: String,
    /// Ids of tasks that must complete first.
    #[serde(default, alias = "dependsOn", alias = "depends_on")]
    pub dependencies: Vec<String>,
    /// Explicit parallel-group tag.
    #[serde(
        default,
        alias = "parallelGroup",
        deserialize_with = "deserialize_group_tag"
    )]
    pub parallel_group: Option<String>,
    /// Role description for the QC step; `None` disables QC.
    #[serde(default, alias = "qcRole", alias = "qcAgentRoleDescription")]
    pub qc_role: Option<String>,
    /// Criteria the QC step verifies against.
    #[serde(default, alias = "verificationCriteria")]
    pub verification_criteria: Option<String>,
    /// Retries allowed after a failed QC verdict; the executor default
    /// applies when unset.
    #[serde(default, alias = "maxRetries")]
    pub max_retries: Option<u32>,
    /// Hint for the tool-call budget of each call made for this task.
    #[serde(default, alias = "estimatedToolCalls", alias = "toolCallBudget")]
    pub tool_call_budget: Option<usize>,
}

/// Parallel groups arrive as numbers from the planner and as strings from
/// hand-written plans.
fn deserialize_group_tag<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tag {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<Tag>::deserialize(deserializer)? {
        Some(Tag::Text(s)) if s.trim().is_empty() => None,
        Some(Tag::Text(s)) => Some(s.trim().to_string()),
        Some(Tag::Number(n)) => Some(n.to_string()),
        None => None,
    })
}

impl TaskDefinition {
    /// Create a task with the given id and prompt and default settings.
    pub fn new(id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            title: format!("Task {}", id),
            role: default_worker_role(),
            model: None,
            prompt: prompt.to_string(),
            dependencies: Vec::new(),
            parallel_group: None,
            qc_role: None,
            verification_criteria: None,
            max_retries: None,
            tool_call_budget: None,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }

    /// Enable the QC step with a role and optional criteria.
    pub fn with_qc(mut self, role: &str, criteria: Option<&str>) -> Self {
        self.qc_role = Some(role.to_string());
        self.verification_criteria = criteria.map(str::to_string);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_tool_budget(mut self, budget: usize) -> Self {
        self.tool_call_budget = Some(budget);
        self
    }

    /// Whether a QC step is configured.
    pub fn has_qc(&self) -> bool {
        self.qc_role.is_some()
    }

    /// Criteria text for the QC prompt.
    pub fn criteria(&self) -> &str {
        self.verification_criteria
            .as_deref()
            .unwrap_or(DEFAULT_VERIFICATION_CRITERIA)
    }

    /// Maximum number of worker invocations (`max_retries + 1`), using
    /// `default_retries` when the task does not set its own.
    pub fn max_attempts(&self, default_retries: u32) -> u32 {
        self.max_retries
            .unwrap_or(default_retries)
            .saturating_add(1)
    }

    /// Fill in a default title, trim identifiers, and drop duplicate and
    /// self-referencing dependencies.
    ///
    /// Returns `true` if a self-reference was removed.
    pub fn normalize(&mut self) -> bool {
        self.id = self.id.trim().to_string();
        if self.title.trim().is_empty() {
            self.title = format!("Task {}", self.id);
        }

        let mut seen = std::collections::HashSet::new();
        let mut had_self = false;
        let id = self.id.clone();
        self.dependencies.retain(|dep| {
            if dep == &id {
                had_self = true;
                return false;
            }
            seen.insert(dep.clone())
        });
        had_self
    }
}
