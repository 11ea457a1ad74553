//! Seams to the external reasoning service and its tools.
//!
//! The orchestration core never talks to a model directly. One call is made
//! of one or more rounds; each round sends the current context and receives
//! text plus any tool calls the model wants to make. A [`ToolRunner`]
//! executes those tool calls and its observations feed the next round.

use crate::core::TokenUsage;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which step of the task a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Worker,
    QualityControl,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Worker => write!(f, "worker"),
            CallKind::QualityControl => write!(f, "qc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// One message in the running transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }

    /// Stable identity used to spot repeated calls.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name, self.arguments)
    }
}

/// Everything sent to the service for one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundRequest {
    pub model: String,
    pub kind: CallKind,
    /// System instructions; never trimmed.
    pub instructions: String,
    /// Retrieved context items still in the window, oldest first.
    pub context: Vec<String>,
    /// Transcript still in the window, oldest first.
    pub turns: Vec<Turn>,
}

impl RoundRequest {
    /// Flatten the request into one prompt for single-shot backends.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        if !self.instructions.is_empty() {
            prompt.push_str(&self.instructions);
            prompt.push_str("\n\n");
        }
        for item in &self.context {
            prompt.push_str("<context>\n");
            prompt.push_str(item);
            prompt.push_str("\n</context>\n\n");
        }
        for turn in &self.turns {
            match turn.role {
                TurnRole::User => {}
                TurnRole::Assistant => prompt.push_str("[assistant]\n"),
                TurnRole::Tool => prompt.push_str("[tool result]\n"),
            }
            prompt.push_str(&turn.content);
            prompt.push_str("\n\n");
        }
        prompt.trim_end().to_string()
    }
}

/// What the service returned for one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundReply {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl RoundReply {
    /// A final answer with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = TokenUsage::new(input, output);
        self
    }
}

/// The opaque remote reasoning service.
///
/// Errors are transport or provider failures and are never retried by the
/// orchestration layer.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn round(&self, request: &RoundRequest) -> Result<RoundReply>;
}

/// Executes tool calls requested by the model.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run one tool call and return the observation fed back to the model.
    async fn run(&self, call: &ToolCall) -> Result<String>;
}

/// Tool runner for deployments that expose no tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolRunner for NoTools {
    async fn run(&self, call: &ToolCall) -> Result<String> {
        Ok(format!("Tool '{}' is not available.", call.name))
    }
}
