//! Reasoning service backed by a headless agent command.
//!
//! `CommandService` runs a CLI agent (by default `claude -p <prompt>
//! --output-format json`) once per round and parses its JSON result. The
//! command manages its own tools, so replies never carry tool calls and
//! every guarded call is a single round.

use crate::core::TokenUsage;
use crate::error::{Error, Result};
use crate::olog_debug;
use crate::orchestration::service::{ReasoningService, RoundReply, RoundRequest};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for one command invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default agent command.
pub const DEFAULT_PROGRAM: &str = "claude";

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// JSON printed by the agent command.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Clone)]
pub struct CommandService {
    binary: PathBuf,
    /// Arguments placed before the prompt arguments.
    prefix_args: Vec<String>,
    timeout: Duration,
    pass_model: bool,
    cwd: Option<PathBuf>,
}

impl CommandService {
    /// Locate `program` on `PATH`.
    ///
    /// # Errors
    /// Returns `Error::CommandNotFound` if the program cannot be found.
    pub fn new(program: &str) -> Result<Self> {
        let binary =
            which::which(program).map_err(|_| Error::CommandNotFound(program.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    /// Use a specific binary without a `PATH` lookup.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            prefix_args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            pass_model: true,
            cwd: None,
        }
    }

    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether to pass `--model <id>` to the command.
    pub fn with_pass_model(mut self, pass_model: bool) -> Self {
        self.pass_model = pass_model;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse the command's JSON output.
    ///
    /// # Errors
    /// Returns `Error::Json` for invalid JSON and `Error::AgentInvocation`
    /// when the command reported an error.
    pub fn parse_json_response(json_str: &str) -> Result<RoundReply> {
        let raw: RawResponse = serde_json::from_str(json_str)?;
        let failed = raw.is_error || raw.subtype.as_deref() == Some("error") || raw.error.is_some();
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "agent command reported an error".to_string());
            return Err(Error::AgentInvocation(message));
        }

        let text = raw
            .result
            .ok_or_else(|| Error::AgentInvocation("Unknown response format".to_string()))?;
        let usage = raw.usage.unwrap_or_default();
        Ok(RoundReply {
            text,
            tool_calls: Vec::new(),
            usage: TokenUsage::new(usage.input_tokens, usage.output_tokens),
        })
    }
}

#[async_trait]
impl ReasoningService for CommandService {
    async fn round(&self, request: &RoundRequest) -> Result<RoundReply> {
        let prompt = request.render_prompt();
        let mut command = Command::new(&self.binary);
        command
            .args(&self.prefix_args)
            .arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("json")
            .kill_on_drop(true);
        if self.pass_model {
            command.arg("--model").arg(&request.model);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        olog_debug!(
            "CommandService: {} {} call to {} ({} chars)",
            self.binary.display(),
            request.kind,
            request.model,
            prompt.len()
        );

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                Error::AgentInvocation(format!(
                    "{} timed out after {:?}",
                    self.binary.display(),
                    self.timeout
                ))
            })?
            .map_err(|e| {
                Error::AgentInvocation(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let parsed = Self::parse_json_response(stdout.trim());

        // A failed exit is never a success, whatever stdout claims.
        if !output.status.success() {
            if let Err(e @ Error::AgentInvocation(_)) = parsed {
                return Err(e);
            }
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.binary.display(),
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::AgentInvocation(message));
        }

        match parsed {
            Ok(reply) => Ok(reply),
            Err(e @ Error::AgentInvocation(_)) => Err(e),
            // Plain-text output from a command without JSON mode.
            Err(_) => Ok(RoundReply::text(stdout.trim())),
        }
    }
}
