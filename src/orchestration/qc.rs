//! Quality-control prompt and verdict parsing.
//!
//! The QC call is asked for a JSON verdict. Models do not always comply, so
//! parsing falls back through progressively looser forms:
//!
//! 1. a fenced ```json block,
//! 2. the outermost `{...}` span in the text,
//! 3. markdown verdict forms such as `Verdict: PASS` / `Score: 85` or
//!    `### 1. Verdict` headings followed by `**PASS**`.
//!
//! Anything else yields [`QcResult::malformed`]. Parsing never fails.
//!
//! ## Example
//!
//! ```
//! use orchestra::orchestration::qc::parse_qc_output;
//!
//! let qc = parse_qc_output(r#"{"passed": true, "score": 92, "feedback": "Solid"}"#, 80);
//! assert!(qc.passed);
//! assert_eq!(qc.score, 92);
//!
//! let qc = parse_qc_output("Verdict: PASS\nScore: 70", 80);
//! assert!(!qc.passed);
//!
//! let qc = parse_qc_output("looks fine to me", 80);
//! assert_eq!(qc.score, 0);
//! ```

use crate::core::{QcResult, TaskDefinition};
use crate::olog_warn;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Default minimum score for a passing verdict.
pub const DEFAULT_PASS_SCORE: u8 = 80;

/// Cap on issues and fixes taken from free-form output.
const MAX_LISTED_ITEMS: usize = 5;

/// Cap on feedback copied from free-form output.
const MAX_FEEDBACK_CHARS: usize = 500;

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

static INLINE_VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)verdict\W{0,4}\s*["']?\**(PASS|FAIL)\b"#).unwrap()
});

static HEADING_VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)###\s*\d+\.\s*Verdict\s*\n\s*\*\*(PASS|FAIL)\*\*").unwrap());

static LOOSE_VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Verdict.*?\*\*(PASS|FAIL)\*\*").unwrap());

static INLINE_SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)score\**:\s*[*\s]*(\d+)").unwrap());

static HEADING_SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)###\s*\d+\.\s*Score\s*\n\s*\*\*(\d+)\*\*").unwrap());

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s+(.+?)\s*$").unwrap());

/// Build the QC prompt for a worker's output.
pub fn qc_prompt(task: &TaskDefinition, worker_output: &str) -> String {
    format!(
        "Review the output of task {id} ({title}).\n\n\
         ## Task\n{prompt}\n\n\
         ## Verification Criteria\n{criteria}\n\n\
         ## Output Under Review\n{output}\n\n\
         ## Response Format\n\
         Respond with a single JSON object in a ```json fenced block:\n\
         {{\"passed\": true|false, \"score\": 0-100, \"feedback\": \"2-3 sentences\", \
         \"issues\": [\"...\"], \"requiredFixes\": [\"...\"]}}",
        id = task.id,
        title = task.title,
        prompt = task.prompt,
        criteria = task.criteria(),
        output = worker_output,
    )
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    passed: Option<bool>,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default, alias = "requiredFixes", alias = "fixes")]
    required_fixes: Vec<String>,
}

impl RawVerdict {
    fn into_result(self, pass_score: u8) -> Option<QcResult> {
        let verdict_pass = match (self.passed, self.verdict.as_deref()) {
            (Some(passed), _) => passed,
            (None, Some(v)) => v.trim().eq_ignore_ascii_case("pass"),
            (None, None) => return None,
        };
        let score = clamp_score(self.score?);
        Some(QcResult::new(
            verdict_pass && score >= pass_score,
            score,
            self.feedback.unwrap_or_default(),
            self.issues,
            self.required_fixes,
        ))
    }
}

fn clamp_score(raw: f64) -> u8 {
    if raw.is_nan() {
        0
    } else {
        raw.round().clamp(0.0, 100.0) as u8
    }
}

/// Parse QC output into a verdict, falling back to a conservative failure.
pub fn parse_qc_output(text: &str, pass_score: u8) -> QcResult {
    if let Some(result) = parse_json_verdict(text, pass_score) {
        return result;
    }
    if let Some(result) = parse_markdown_verdict(text, pass_score) {
        return result;
    }
    olog_warn!(
        "QC output could not be parsed ({} chars); recording a failed verdict",
        text.len()
    );
    QcResult::malformed()
}

fn parse_json_verdict(text: &str, pass_score: u8) -> Option<QcResult> {
    let mut candidates: Vec<&str> = FENCED_JSON_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push(&text[start..=end]);
        }
    }

    candidates.into_iter().find_map(|candidate| {
        serde_json::from_str::<RawVerdict>(candidate)
            .ok()
            .and_then(|raw| raw.into_result(pass_score))
    })
}

fn parse_markdown_verdict(text: &str, pass_score: u8) -> Option<QcResult> {
    let verdict = [&*INLINE_VERDICT_RE, &*HEADING_VERDICT_RE, &*LOOSE_VERDICT_RE]
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("pass"));
    let score = [&*INLINE_SCORE_RE, &*HEADING_SCORE_RE]
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(clamp_score);

    if verdict.is_none() && score.is_none() {
        return None;
    }

    let score = score.unwrap_or(0);
    let bullets: Vec<String> = BULLET_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .take(MAX_LISTED_ITEMS)
        .collect();
    let feedback: String = text.trim().chars().take(MAX_FEEDBACK_CHARS).collect();

    Some(QcResult::new(
        verdict.unwrap_or(false) && score >= pass_score,
        score,
        feedback,
        bullets.clone(),
        bullets,
    ))
}
