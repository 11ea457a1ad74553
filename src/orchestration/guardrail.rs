//! Guardrails around one logical call to the reasoning service.
//!
//! A guarded call runs rounds until the model answers without requesting
//! tools, or until one of three stops trips:
//!
//! - the tool-call circuit breaker (hard cap on tool invocations),
//! - the repetition detector (near-duplicate output lines or the same tool
//!   call repeated in a row),
//! - the context budget, when even after eviction the context cannot fit
//!   the model window.
//!
//! Guardrail stops are ordinary outcomes reported through
//! [`Termination`], never errors. Every round passes through the admission
//! queue before it reaches the service.

use crate::core::{Termination, TokenUsage};
use crate::error::{Error, Result};
use crate::orchestration::admission::AdmissionQueue;
use crate::orchestration::service::{
    CallKind, ReasoningService, RoundRequest, ToolCall, ToolRunner, Turn,
};
use crate::{olog_debug, olog_trace, olog_warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TOOL_CALL_LIMIT: usize = 100;
pub const DEFAULT_RESERVED_OUTPUT_TOKENS: usize = 4096;
pub const DEFAULT_MODEL_WINDOW: usize = 128_000;

/// Lines shorter than this are ignored by the repetition detector.
const MIN_REPEAT_LINE_CHARS: usize = 8;

/// Context windows by model id. Exact match first, then longest prefix.
const MODEL_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4", 8_192),
    ("gpt-4-turbo", 128_000),
    ("gpt-4.1", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-5-mini", 128_000),
    ("gpt-3.5-turbo", 4_096),
    ("gpt-3.5-turbo-16k", 16_384),
    ("claude-3-opus", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("gemini-pro", 32_768),
    ("gemini-1.5-pro", 1_000_000),
];

/// Context window of `model` in tokens.
pub fn model_window(model: &str) -> usize {
    if let Some((_, window)) = MODEL_WINDOWS.iter().find(|(id, _)| *id == model) {
        return *window;
    }
    MODEL_WINDOWS
        .iter()
        .filter(|(id, _)| model.starts_with(id))
        .max_by_key(|(id, _)| id.len())
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_MODEL_WINDOW)
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Tunables for every guarded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Hard cap on tool invocations per call.
    pub tool_call_limit: usize,
    /// Tokens held back from the model window for the reply.
    pub reserved_output_tokens: usize,
    /// Number of recent output lines the detector keeps.
    pub loop_window_lines: usize,
    /// Minimum significant lines before the duplicate ratio is judged.
    pub loop_min_lines: usize,
    /// Fraction of duplicate lines in the window that counts as a loop.
    pub loop_duplicate_ratio: f64,
    /// Identical tool calls allowed in a row.
    pub max_identical_tool_calls: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            tool_call_limit: DEFAULT_TOOL_CALL_LIMIT,
            reserved_output_tokens: DEFAULT_RESERVED_OUTPUT_TOKENS,
            loop_window_lines: 40,
            loop_min_lines: 12,
            loop_duplicate_ratio: 0.6,
            max_identical_tool_calls: 3,
        }
    }
}

impl GuardrailConfig {
    /// Token budget for context sent to `model`.
    pub fn context_budget(&self, model: &str) -> usize {
        model_window(model).saturating_sub(self.reserved_output_tokens)
    }

    /// Tool-call limit for one call; a task hint may lower it, never raise it.
    pub fn tool_limit_for(&self, hint: Option<usize>) -> usize {
        hint.map_or(self.tool_call_limit, |h| h.min(self.tool_call_limit))
    }
}

/// Detects a call that has started repeating itself.
#[derive(Debug)]
pub struct RepetitionDetector {
    lines: VecDeque<String>,
    window: usize,
    min_lines: usize,
    ratio: f64,
    last_signature: Option<String>,
    identical_run: usize,
    max_identical: usize,
}

impl RepetitionDetector {
    pub fn new(config: &GuardrailConfig) -> Self {
        Self {
            lines: VecDeque::with_capacity(config.loop_window_lines),
            window: config.loop_window_lines.max(1),
            min_lines: config.loop_min_lines,
            ratio: config.loop_duplicate_ratio,
            last_signature: None,
            identical_run: 0,
            max_identical: config.max_identical_tool_calls,
        }
    }

    /// Add generated text and report whether the window now looks like a loop.
    pub fn observe_text(&mut self, text: &str) -> bool {
        for line in text.lines() {
            let line = line.trim();
            if line.chars().count() < MIN_REPEAT_LINE_CHARS {
                continue;
            }
            if self.lines.len() == self.window {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
        self.is_repeating()
    }

    /// Record a tool call; `true` once the same call repeats beyond the limit.
    pub fn observe_tool_call(&mut self, call: &ToolCall) -> bool {
        let signature = call.signature();
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.identical_run += 1;
        } else {
            self.last_signature = Some(signature);
            self.identical_run = 1;
        }
        self.identical_run > self.max_identical
    }

    /// Fraction of lines in the window that duplicate an earlier one.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.lines.is_empty() {
            return 0.0;
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in &self.lines {
            *counts.entry(line.as_str()).or_default() += 1;
        }
        1.0 - counts.len() as f64 / self.lines.len() as f64
    }

    fn is_repeating(&self) -> bool {
        self.lines.len() >= self.min_lines && self.duplicate_ratio() >= self.ratio
    }
}

/// Context held for one call, trimmed to fit the model window.
///
/// Eviction order: retrieved context oldest first, then transcript turns
/// oldest first. The instructions, the opening prompt and the latest turn
/// always stay.
#[derive(Debug)]
struct ContextWindow {
    instructions: String,
    context: VecDeque<String>,
    turns: Vec<Turn>,
    budget: usize,
    evicted: usize,
}

impl ContextWindow {
    fn new(instructions: String, context: Vec<String>, prompt: String, budget: usize) -> Self {
        Self {
            instructions,
            context: context.into(),
            turns: vec![Turn::user(prompt)],
            budget,
            evicted: 0,
        }
    }

    fn estimate(&self) -> usize {
        estimate_tokens(&self.instructions)
            + self.context.iter().map(|c| estimate_tokens(c)).sum::<usize>()
            + self
                .turns
                .iter()
                .map(|t| estimate_tokens(&t.content))
                .sum::<usize>()
    }

    /// Evict until the estimate fits; `false` if it cannot.
    fn fit(&mut self) -> bool {
        while self.estimate() > self.budget {
            if self.context.pop_front().is_some() {
                self.evicted += 1;
                olog_debug!("Guardrail: evicted oldest context item");
                continue;
            }
            if self.turns.len() > 2 {
                self.turns.remove(1);
                self.evicted += 1;
                olog_debug!("Guardrail: evicted oldest transcript turn");
                continue;
            }
            return false;
        }
        true
    }

    fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    fn request(&self, model: &str, kind: CallKind) -> RoundRequest {
        RoundRequest {
            model: model.to_string(),
            kind,
            instructions: self.instructions.clone(),
            context: self.context.iter().cloned().collect(),
            turns: self.turns.clone(),
        }
    }
}

/// Inputs for one guarded call.
#[derive(Debug, Clone)]
pub struct GuardedCall {
    pub model: String,
    pub kind: CallKind,
    pub instructions: String,
    /// Evictable retrieved context, oldest first.
    pub context: Vec<String>,
    pub prompt: String,
    pub tool_call_limit: usize,
}

/// Result of one guarded call.
#[derive(Debug, Clone)]
pub struct GuardedOutcome {
    pub output: String,
    pub transcript: Vec<Turn>,
    pub tokens: TokenUsage,
    pub tool_calls: usize,
    pub terminated_by: Termination,
    pub duration: Duration,
    pub rounds: u32,
    /// Context items and turns evicted to stay in budget.
    pub evicted: usize,
}

/// Applies the guardrails to calls made through a service.
#[derive(Debug, Clone, Default)]
pub struct CallGuardrail {
    config: GuardrailConfig,
}

impl CallGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Run one call to completion or until a guardrail stops it.
    ///
    /// # Errors
    /// Service failures surface as `Error::AgentInvocation`.
    pub async fn run(
        &self,
        service: &dyn ReasoningService,
        tools: &dyn ToolRunner,
        queue: &AdmissionQueue,
        call: GuardedCall,
    ) -> Result<GuardedOutcome> {
        let started = Instant::now();
        let budget = self.config.context_budget(&call.model);
        let mut window = ContextWindow::new(call.instructions, call.context, call.prompt, budget);
        let mut detector = RepetitionDetector::new(&self.config);
        let mut tokens = TokenUsage::default();
        let mut tool_calls = 0usize;
        let mut rounds = 0u32;
        let mut texts: Vec<String> = Vec::new();

        let terminated_by = 'rounds: loop {
            if !window.fit() {
                olog_warn!(
                    "Guardrail: {} call for {} cannot fit {} tokens",
                    call.kind,
                    call.model,
                    budget
                );
                break Termination::TokenBudget;
            }

            let request = window.request(&call.model, call.kind);
            let reply = queue
                .enqueue(1, || service.round(&request))
                .await
                .map_err(|e| match e {
                    Error::AgentInvocation(_) => e,
                    other => Error::AgentInvocation(other.to_string()),
                })?;
            rounds += 1;
            tokens += reply.usage;
            olog_trace!(
                "Guardrail: round {} returned {} chars, {} tool calls",
                rounds,
                reply.text.len(),
                reply.tool_calls.len()
            );

            if !reply.text.is_empty() {
                texts.push(reply.text.clone());
            }
            window.push(Turn::assistant(describe_reply(&reply.text, &reply.tool_calls)));

            if detector.observe_text(&reply.text) {
                olog_warn!(
                    "Guardrail: repetitive output from {} (duplicate ratio {:.2})",
                    call.model,
                    detector.duplicate_ratio()
                );
                break Termination::LoopDetected;
            }
            if reply.tool_calls.is_empty() {
                break Termination::Normal;
            }

            for tool_call in &reply.tool_calls {
                if tool_calls >= call.tool_call_limit {
                    olog_warn!(
                        "Guardrail: tool-call limit {} reached for {} call",
                        call.tool_call_limit,
                        call.kind
                    );
                    break 'rounds Termination::CircuitBreaker;
                }
                if detector.observe_tool_call(tool_call) {
                    olog_warn!(
                        "Guardrail: tool call '{}' repeated with identical arguments",
                        tool_call.name
                    );
                    break 'rounds Termination::LoopDetected;
                }
                tool_calls += 1;
                let observation = match tools.run(tool_call).await {
                    Ok(observation) => observation,
                    Err(e) => format!("Tool '{}' failed: {}", tool_call.name, e),
                };
                window.push(Turn::tool(observation));
            }
        };

        let output = match terminated_by {
            Termination::Normal => texts.last().cloned().unwrap_or_default(),
            _ => texts.join("\n"),
        };

        Ok(GuardedOutcome {
            output,
            transcript: window.turns,
            tokens,
            tool_calls,
            terminated_by,
            duration: started.elapsed(),
            rounds,
            evicted: window.evicted,
        })
    }
}

fn describe_reply(text: &str, calls: &[ToolCall]) -> String {
    let mut content = text.to_string();
    for call in calls {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&format!("-> {}({})", call.name, call.arguments));
    }
    content
}
