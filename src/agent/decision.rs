//! Decision parsing for model turns.
//!
//! Every model response is classified into exactly one [`Decision`] through
//! three layers: structured tool calls, text-rescued tool calls, and a
//! hallucination scrub, followed by sentinel/phrase/heuristic checks.
//! The scrubber patterns are deliberately narrow: under-matching lets
//! fabricated tool results into history, over-matching deletes legitimate
//! prose.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::base::CompletionResponse;

/// Sentinel the model must emit to end the investigation.
pub const INVESTIGATION_COMPLETE: &str = "[INVESTIGATION_COMPLETE]";

/// The classified intent of a single model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Decision {
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: HashMap<String, Value>,
    },
    Done {
        result: String,
    },
    Thinking {
        content: String,
    },
    InvalidToolCall {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detected_tool_name: Option<String>,
    },
    RequiresSelfCheck {
        content: String,
    },
    HallucinationDetected {
        content: String,
        cleaned_content: String,
    },
}

impl Decision {
    /// The wire name of the decision (matches the serialized `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::ToolCall { .. } => "tool_call",
            Decision::Done { .. } => "done",
            Decision::Thinking { .. } => "thinking",
            Decision::InvalidToolCall { .. } => "invalid_tool_call",
            Decision::RequiresSelfCheck { .. } => "requires_self_check",
            Decision::HallucinationDetected { .. } => "hallucination_detected",
        }
    }
}

// ---------------------------------------------------------------------------
// Layer 2: text-rescue patterns
// ---------------------------------------------------------------------------

static CN_TEXT_CALL_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)我将使用\s*[`"“]?([A-Za-z_][A-Za-z0-9_]*)[`"”]?\s*工具[:：]?\s*(\{.*)"#)
        .unwrap()
});

static EN_TEXT_CALL_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?si)I(?:'ll| will)\s+use\s+(?:the\s+)?[`"]?([A-Za-z_][A-Za-z0-9_]*)[`"]?\s+tool[:：]?\s*(\{.*)"#,
    )
    .unwrap()
});

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

// ---------------------------------------------------------------------------
// Layer 3: hallucination patterns
// ---------------------------------------------------------------------------

static HALLUCINATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"</user>").unwrap(),
        Regex::new(r#"工具\s*"[^"]+"\s*执行(成功|失败)"#).unwrap(),
        Regex::new(r#"(?i)Tool\s*"[^"]+"\s*(executed|completed|failed)"#).unwrap(),
        Regex::new(r"(?m)^File:[ \t]+\S+\r?\nLines:[ \t]+\d+-\d+").unwrap(),
    ]
});

// ---------------------------------------------------------------------------
// Text tool-call phrases (without a recoverable JSON payload)
// ---------------------------------------------------------------------------

static TEXT_CALL_PHRASES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"我将使用\s*[`"“]?([A-Za-z_][A-Za-z0-9_]*)[`"”]?\s*工具"#).unwrap(),
        Regex::new(r#"(?i)I'll\s+use\s+the\s+[`"]?([A-Za-z_][A-Za-z0-9_]*)[`"]?\s+tool"#).unwrap(),
        Regex::new(r#"使用\s*[`"“]?([A-Za-z_][A-Za-z0-9_]*)[`"”]?\s*工具"#).unwrap(),
    ]
});

// ---------------------------------------------------------------------------
// Thinking heuristics
// ---------------------------------------------------------------------------

static EN_THINKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\blet me\b|\bI'll\s+(check|look|examine|read|search|review|analyze|start)\b|\bI\s+will\s+(check|look|examine)\b")
        .unwrap()
});

static CN_THINKING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"需要|让我|我(来|需要|应该)").unwrap());

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Classify a model response into a [`Decision`].
///
/// `prior` is the decision history of the run (used for the self-check gate)
/// and `known_tools` the names advertised to the model (used to attribute
/// fenced JSON blocks to a tool).
pub fn parse_decision(
    response: &CompletionResponse,
    prior: &[Decision],
    known_tools: &[String],
) -> Decision {
    // Layer 1: structured tool calls. The first one wins.
    if let Some(tc) = response.tool_calls.first() {
        return Decision::ToolCall {
            name: tc.name.clone(),
            arguments: tc.arguments.clone(),
        };
    }

    let content = response.content.clone();

    // Layer 2: rescue a tool call from free text.
    if let Some((name, arguments)) = rescue_text_tool_call(&content, known_tools) {
        return Decision::ToolCall { name, arguments };
    }

    // Layer 3: scrub fabricated tool results.
    if let Some(idx) = find_hallucination(&content) {
        let cleaned_content = content[..idx].trim().to_string();
        return Decision::HallucinationDetected {
            content,
            cleaned_content,
        };
    }

    // Completion sentinel, gated on a preceding self-check.
    if content.contains(INVESTIGATION_COMPLETE) {
        let last_tool = prior.iter().rev().find_map(|d| match d {
            Decision::ToolCall { name, .. } => Some(name.as_str()),
            _ => None,
        });
        if last_tool == Some("think") {
            return Decision::Done { result: content };
        }
        return Decision::RequiresSelfCheck { content };
    }

    // Text-form tool call without a usable payload.
    for re in TEXT_CALL_PHRASES.iter() {
        if let Some(caps) = re.captures(&content) {
            let detected_tool_name = caps.get(1).map(|m| m.as_str().to_string());
            return Decision::InvalidToolCall {
                content,
                detected_tool_name,
            };
        }
    }

    // Planning prose without an action.
    if EN_THINKING.is_match(&content) || CN_THINKING.is_match(&content) {
        return Decision::Thinking { content };
    }

    // Defensive default: treat the content as the final result.
    Decision::Done { result: content }
}

/// Attempt to recover `(tool, arguments)` from free text.
fn rescue_text_tool_call(
    content: &str,
    known_tools: &[String],
) -> Option<(String, HashMap<String, Value>)> {
    for re in [&*CN_TEXT_CALL_JSON, &*EN_TEXT_CALL_JSON] {
        if let Some(caps) = re.captures(content) {
            let name = caps.get(1)?.as_str().to_string();
            if let Some(args) = parse_arguments(caps.get(2)?.as_str()) {
                return Some((name, args));
            }
            // Parse failure falls through to the next layer.
            return None;
        }
    }

    // A fenced code block near a known tool name.
    if let Some(caps) = FENCED_JSON.captures(content) {
        let block = caps.get(1)?.as_str();
        let name = known_tools
            .iter()
            .find(|t| contains_word(content, t))?
            .clone();
        if let Some(args) = parse_arguments(block) {
            return Some((name, args));
        }
    }

    None
}

/// Whole-word containment check for tool names.
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + word.len()..].chars().next();
        let boundary =
            |c: Option<char>| c.map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
        boundary(before) && boundary(after)
    })
}

/// Parse a JSON object after a small repair pass.
fn parse_arguments(raw: &str) -> Option<HashMap<String, Value>> {
    let repaired = repair_json(raw);
    serde_json::from_str::<HashMap<String, Value>>(&repaired).ok()
}

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static UNQUOTED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());

/// Best-effort JSON repair for model-emitted argument blobs.
///
/// Fixes smart quotes, Chinese colons, trailing commas, unquoted keys, and
/// trailing junk after the last closing brace.
pub fn repair_json(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    // Smart quotes → straight quotes; Chinese colon → ASCII.
    s = s
        .replace(['“', '”'], "\"")
        .replace(['‘', '’'], "'")
        .replace('：', ":");

    // Strip trailing junk after the last closing brace.
    if let Some(pos) = s.rfind('}') {
        s.truncate(pos + 1);
    }

    // Strip trailing commas before a closing brace/bracket.
    s = TRAILING_COMMA.replace_all(&s, "$1").to_string();

    // Quote unquoted keys.
    s = UNQUOTED_KEY.replace_all(&s, "$1\"$2\":").to_string();

    s
}

// ---------------------------------------------------------------------------
// Hallucination scrub
// ---------------------------------------------------------------------------

/// Byte offset of the first fabricated-tool-result pattern, if any.
pub fn find_hallucination(content: &str) -> Option<usize> {
    HALLUCINATION_PATTERNS
        .iter()
        .filter_map(|re| re.find(content).map(|m| m.start()))
        .min()
}

/// Remove fabricated tool results from a model response.
///
/// Clean text passes through unchanged; the cleaner is idempotent.
pub fn scrub_content(content: &str) -> String {
    match find_hallucination(content) {
        Some(idx) => content[..idx].trim().to_string(),
        None => content.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Stuck detection and helpers
// ---------------------------------------------------------------------------

/// Deterministic serialization of tool arguments (sorted keys).
pub fn canonical_arguments(arguments: &HashMap<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = arguments.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// True when the last `threshold` decisions are tool calls identical in
/// name and canonically serialized arguments.
pub fn is_stuck(decisions: &[Decision], threshold: usize) -> bool {
    if threshold == 0 || decisions.len() < threshold {
        return false;
    }
    let tail = &decisions[decisions.len() - threshold..];
    let mut signature: Option<(String, String)> = None;
    for decision in tail {
        match decision {
            Decision::ToolCall { name, arguments } => {
                let sig = (name.clone(), canonical_arguments(arguments));
                match &signature {
                    None => signature = Some(sig),
                    Some(prev) if *prev == sig => {}
                    Some(_) => return false,
                }
            }
            _ => return false,
        }
    }
    true
}

/// Strip the first completion sentinel and return the trimmed remainder.
pub fn extract_findings(content: &str) -> String {
    content
        .replacen(INVESTIGATION_COMPLETE, "", 1)
        .trim()
        .to_string()
}
