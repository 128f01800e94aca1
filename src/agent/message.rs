//! Conversation data model: messages, sessions, budgets, and turn records.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::decision::Decision;
use crate::providers::base::{TokenUsage, ToolCall};
use crate::utils::helpers;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Conversation role. Tool results live in user messages carrying
/// `tool_name` metadata, so only two roles exist in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Optional per-message metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Set on tool-result messages: the tool that produced the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Origin of the content, e.g. the file path a read_file result came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Explicit compressibility override. `Some(false)` exempts the message
    /// from compression regardless of size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressible: Option<bool>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_name.is_none() && self.source.is_none() && self.compressible.is_none()
    }

    /// Metadata for a tool-result message.
    pub fn tool_result(tool_name: &str, source: Option<String>) -> Self {
        Self {
            tool_name: Some(tool_name.to_string()),
            source,
            compressible: Some(true),
        }
    }

    /// Metadata for a feedback message that must never be compressed.
    pub fn protected() -> Self {
        Self {
            tool_name: None,
            source: None,
            compressible: Some(false),
        }
    }
}

/// A single conversation message.
///
/// The `key` is stable across compression; when `compressed` is set the
/// `content` holds a placeholder and `original_tokens` the pre-compress
/// estimate. The original content lives in storage under the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: String,
    pub role: Role,
    pub content: String,
    pub tokens: usize,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_tokens: Option<usize>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

/// Allocate a fresh opaque message key (`msg_` + 8 hex chars).
pub fn new_message_key() -> String {
    format!("msg_{}", helpers::short_id(8))
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Immutable token budget configuration for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_reserved_for_synthesis")]
    pub reserved_for_synthesis: usize,
    #[serde(default = "default_reserved_for_recalls")]
    pub reserved_for_recalls: usize,
    #[serde(default = "default_reserved_for_next_steps")]
    pub reserved_for_next_steps: usize,
}

fn default_context_window() -> usize {
    262_144
}

fn default_reserved_for_synthesis() -> usize {
    30_000
}

fn default_reserved_for_recalls() -> usize {
    20_000
}

fn default_reserved_for_next_steps() -> usize {
    15_000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            reserved_for_synthesis: default_reserved_for_synthesis(),
            reserved_for_recalls: default_reserved_for_recalls(),
            reserved_for_next_steps: default_reserved_for_next_steps(),
        }
    }
}

impl BudgetConfig {
    /// Sum of the three reservations.
    pub fn reserved(&self) -> usize {
        self.reserved_for_synthesis + self.reserved_for_recalls + self.reserved_for_next_steps
    }
}

/// Where the used tokens went.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBreakdown {
    pub system_prompt: usize,
    pub messages: usize,
    pub reserved: usize,
}

/// Derived budget state at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub breakdown: BudgetBreakdown,
}

impl BudgetState {
    pub fn compute(
        config: &BudgetConfig,
        system_prompt_tokens: usize,
        message_tokens: usize,
    ) -> Self {
        let total = config.context_window;
        let used = system_prompt_tokens + message_tokens;
        let reserved = config.reserved();
        let available = total.saturating_sub(used).saturating_sub(reserved);
        Self {
            total,
            used,
            available,
            breakdown: BudgetBreakdown {
                system_prompt: system_prompt_tokens,
                messages: message_tokens,
                reserved,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// On-disk location map for preserved message originals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStorageMap {
    /// Message key → absolute path of the preserved original.
    #[serde(default)]
    pub messages: HashMap<String, PathBuf>,
}

/// A single investigation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub query: String,
    pub started_at: String,
    pub working_dir: PathBuf,
    pub messages: Vec<Message>,
    pub total_tokens: usize,
    #[serde(default)]
    pub storage: SessionStorageMap,
    pub budget: BudgetConfig,
}

/// Allocate a session id: timestamp plus a short random suffix.
pub fn new_session_id() -> String {
    format!(
        "{}-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        helpers::short_id(6)
    )
}

// ---------------------------------------------------------------------------
// Synthesis projection
// ---------------------------------------------------------------------------

/// Flattened view of a message handed to the Synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisMessage {
    pub key: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub compressed: bool,
}

// ---------------------------------------------------------------------------
// LLM turn debug records
// ---------------------------------------------------------------------------

/// A message as it appeared in a turn's model input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMessage {
    pub key: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub compressed: bool,
}

/// Full model input for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInput {
    pub system_prompt: String,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<Value>,
}

/// Full model output for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Outcome of the tool execution that followed a tool-call decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnToolResult {
    pub name: String,
    pub ok: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// Complete debug record of one LLM turn, persisted per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LLMTurn {
    /// Owning agent: `investigator`, `synthesizer`, or `main`.
    pub agent: String,
    pub iteration: u32,
    pub input: TurnInput,
    pub output: TurnOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<TurnToolResult>,
    pub started_at: String,
    pub duration_ms: u64,
}
