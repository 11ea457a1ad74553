//! Plan loading: structured records or planner markdown into task
//! definitions.
//!
//! Structured plans are JSON (a bare array or `{"tasks": [...]}`) or TOML
//! (`[[tasks]]`), with camelCase aliases accepted on every field.
//!
//! Markdown plans are split at `**Task ID:**` markers. Inside a section,
//! bold labels such as `**Title:**` or `**Depends On:**` introduce fields;
//! only known labels end a field, so other bold text inside a prompt is
//! kept. Prompt bodies wrapped in `<details>` blocks or code fences are
//! unwrapped. Every markdown task is reviewed: a section without a QC role
//! gets [`DEFAULT_QC_ROLE`].

use crate::core::task::{TaskDefinition, DEFAULT_QC_ROLE};
use crate::error::{Error, Result};
use crate::{olog_debug, olog_warn};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

static TASK_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\*\*\s*Task\s+ID\s*(?::\*\*|\*\*\s*:)").unwrap());

static FIELD_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*\s*([A-Za-z][A-Za-z ]*?)\s*(?::\*\*|\*\*\s*:)").unwrap()
});

static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[\s`]*(task[-\s]*\d+(?:\.\d+)*|[A-Za-z0-9_.-]+)").unwrap());

static ID_SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-\s]+").unwrap());

static DETAILS_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)</?details[^>]*>").unwrap());

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<summary[^>]*>.*?</summary>").unwrap());

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Input formats understood by [`parse_plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Json,
    Toml,
    Markdown,
}

impl PlanFormat {
    /// Pick a format from the file extension, falling back to the content.
    pub fn detect(path: Option<&Path>, content: &str) -> Self {
        let ext = path
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => return PlanFormat::Json,
            Some("toml") => return PlanFormat::Toml,
            Some("md") | Some("markdown") => return PlanFormat::Markdown,
            _ => {}
        }

        let trimmed = content.trim_start();
        if trimmed.starts_with("[[") {
            PlanFormat::Toml
        } else if trimmed.starts_with('[') || trimmed.starts_with('{') {
            PlanFormat::Json
        } else if TASK_MARKER_RE.is_match(content) {
            PlanFormat::Markdown
        } else {
            PlanFormat::Toml
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonPlan {
    List(Vec<TaskDefinition>),
    Wrapped { tasks: Vec<TaskDefinition> },
}

#[derive(Deserialize)]
struct TomlPlan {
    #[serde(default)]
    tasks: Vec<TaskDefinition>,
}

/// Read and parse a plan file.
pub fn load_plan(path: &Path) -> Result<Vec<TaskDefinition>> {
    let content = std::fs::read_to_string(path)?;
    let format = PlanFormat::detect(Some(path), &content);
    olog_debug!("Plan: loading {} as {:?}", path.display(), format);
    parse_plan(&content, format)
}

/// Parse a plan in the given format into normalised task definitions.
///
/// # Errors
/// Returns `Error::PlanParse` if no task can be extracted, or the
/// underlying JSON/TOML error for malformed structured input.
pub fn parse_plan(content: &str, format: PlanFormat) -> Result<Vec<TaskDefinition>> {
    let mut tasks = match format {
        PlanFormat::Json => match serde_json::from_str::<JsonPlan>(content)? {
            JsonPlan::List(tasks) | JsonPlan::Wrapped { tasks } => tasks,
        },
        PlanFormat::Toml => toml::from_str::<TomlPlan>(content)?.tasks,
        PlanFormat::Markdown => parse_markdown(content),
    };

    if tasks.is_empty() {
        return Err(Error::PlanParse("no tasks found in plan".to_string()));
    }
    for task in &mut tasks {
        if task.normalize() {
            olog_warn!("Plan: task {} lists itself as a dependency; removed", task.id);
        }
    }
    Ok(tasks)
}

/// Normalise a task id: whitespace and dash runs become a single `-`.
pub fn normalize_id(raw: &str) -> String {
    let cleaned = raw.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
    ID_SEPARATOR_RE.replace_all(cleaned.trim(), "-").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Prompt,
    Dependencies,
    ParallelGroup,
    Role,
    QcRole,
    Criteria,
    Model,
    MaxRetries,
    ToolBudget,
}

impl Field {
    fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        Some(match label.as_str() {
            "title" | "name" => Field::Title,
            "prompt" | "task prompt" | "instructions" => Field::Prompt,
            "dependencies" | "depends on" => Field::Dependencies,
            "parallel group" | "group" => Field::ParallelGroup,
            "agent role description" | "worker role" | "role" => Field::Role,
            "qc agent role description" | "qc role" => Field::QcRole,
            "verification criteria" | "acceptance criteria" => Field::Criteria,
            "recommended model" | "model" => Field::Model,
            "max retries" => Field::MaxRetries,
            "estimated tool calls" | "tool call budget" => Field::ToolBudget,
            _ => return None,
        })
    }

    fn is_multiline(&self) -> bool {
        matches!(self, Field::Prompt | Field::Criteria)
    }
}

fn parse_markdown(content: &str) -> Vec<TaskDefinition> {
    let starts: Vec<(usize, usize)> = TASK_MARKER_RE
        .find_iter(content)
        .map(|m| (m.start(), m.end()))
        .collect();
    olog_debug!("Plan: {} task markers in markdown", starts.len());

    let mut tasks = Vec::with_capacity(starts.len());
    for (i, &(_, body_start)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(content.len(), |&(s, _)| s);
        match parse_section(&content[body_start..end]) {
            Some(task) => tasks.push(task),
            None => olog_warn!("Plan: task section {} has no id; skipped", i + 1),
        }
    }
    tasks
}

/// Parse one section; `body` starts right after the `**Task ID:**` marker.
fn parse_section(body: &str) -> Option<TaskDefinition> {
    let id_match = TASK_ID_RE.captures(body)?.get(1)?;
    let id = normalize_id(id_match.as_str());
    if id.is_empty() {
        return None;
    }

    let markers: Vec<(Field, usize, usize)> = FIELD_MARKER_RE
        .captures_iter(body)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let field = Field::from_label(c.get(1)?.as_str())?;
            Some((field, whole.start(), whole.end()))
        })
        .collect();

    let mut task = TaskDefinition::new(&id, "");
    for (i, &(field, _, value_start)) in markers.iter().enumerate() {
        let value_end = markers.get(i + 1).map_or(body.len(), |&(_, s, _)| s);
        let raw = clean_value(&body[value_start..value_end]);
        let value = if field.is_multiline() {
            raw
        } else {
            first_line(&raw)
        };
        apply_field(&mut task, field, value);
    }
    if task.qc_role.is_none() {
        task.qc_role = Some(DEFAULT_QC_ROLE.to_string());
    }
    Some(task)
}

/// Trim a raw field value, dropping a trailing list bullet that belongs to
/// the next label.
fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| c == '-' || c == '*' || c.is_whitespace())
        .to_string()
}

fn first_line(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .trim_matches('`')
        .trim()
        .to_string()
}

fn is_none_marker(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "none" | "n/a" | "na" | "-"
    )
}

/// Strip `<details>`/`<summary>` wrappers and an enclosing code fence.
pub fn unwrap_body(raw: &str) -> String {
    let without_summary = SUMMARY_RE.replace_all(raw, "");
    let without_details = DETAILS_TAG_RE.replace_all(&without_summary, "");
    let text = without_details.trim();

    if let Some(rest) = text.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            // Drop the language tag line.
            let inner = inner.split_once('\n').map_or("", |(_, body)| body);
            return inner.trim().to_string();
        }
    }
    text.to_string()
}

fn apply_field(task: &mut TaskDefinition, field: Field, value: String) {
    match field {
        Field::Title => {
            if !value.is_empty() {
                task.title = value;
            }
        }
        Field::Prompt => task.prompt = unwrap_body(&value),
        Field::Dependencies => {
            task.dependencies = if is_none_marker(&value) {
                Vec::new()
            } else {
                value
                    .split(',')
                    .map(normalize_id)
                    .filter(|d| !d.is_empty() && !is_none_marker(d))
                    .collect()
            };
        }
        Field::ParallelGroup => {
            task.parallel_group = (!is_none_marker(&value)).then(|| value.trim().to_string());
        }
        Field::Role => {
            if !value.is_empty() {
                task.role = value;
            }
        }
        Field::QcRole => {
            task.qc_role = (!is_none_marker(&value)).then_some(value);
        }
        Field::Criteria => {
            let criteria = unwrap_body(&value);
            task.verification_criteria = (!criteria.is_empty()).then_some(criteria);
        }
        Field::Model => {
            task.model = (!is_none_marker(&value)).then_some(value);
        }
        Field::MaxRetries => {
            task.max_retries = first_number(&value).map(|n| n as u32);
        }
        Field::ToolBudget => task.tool_call_budget = first_number(&value),
    }
}

fn first_number(value: &str) -> Option<usize> {
    NUMBER_RE.find(value)?.as_str().parse().ok()
}
