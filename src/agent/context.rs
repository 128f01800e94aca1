//! The context manager: a token-budgeted conversation store.
//!
//! Owns the live session for the duration of a run. All mutation goes
//! through this type, which gives every invariant a single enforcement
//! point: `total_tokens` always equals the sum of message token estimates,
//! compression happens at most once per message, and recall never mutates
//! the conversation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::agent::estimator::estimate_tokens;
use crate::agent::message::{
    new_message_key, new_session_id, BudgetConfig, BudgetState, LLMTurn, Message,
    MessageMetadata, Role, Session, SynthesisMessage, TurnMessage,
};
use crate::agent::storage::SessionStorage;
use crate::bus::events::{AgentEvent, EventBus};
use crate::errors::ContextError;
use crate::providers::base::ChatMessage;
use crate::utils::helpers;

/// Messages below this token count are only compressible when they carry a
/// tool name.
const MIN_TOKENS_TO_COMPRESS: usize = 200;
/// Compression starts when used/total reaches this ratio.
const TRIGGER_RATIO: f64 = 0.80;
/// Compression stops once used/total falls to this ratio.
const TARGET_RATIO: f64 = 0.60;
/// The most recent messages are never compressed or discarded.
const PROTECTED_RECENT_MESSAGES: usize = 4;
/// Floor for the estimated size of a compressed placeholder.
const COMPRESSED_FLOOR_TOKENS: usize = 50;
/// Estimated post-compression ratio for tool results.
const TOOL_RESULT_COMPRESS_RATIO: f64 = 0.05;
/// Estimated post-compression ratio for everything else.
const DEFAULT_COMPRESS_RATIO: f64 = 0.20;
/// How many compressed keys to suggest on a failed recall.
const RECALL_HINT_KEYS: usize = 5;
/// Snippet length for generic placeholders.
const SNIPPET_CHARS: usize = 200;
/// How many extracted symbols a read_file placeholder lists.
const MAX_PLACEHOLDER_SYMBOLS: usize = 5;

static SYMBOL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:function|class|interface|type|def)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Compression urgency. High-value targets go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CompressPriority {
    High,
    Medium,
    Low,
}

/// Result payload of a recall request. Never thrown: failures are data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// On a missing key: currently-compressed keys the caller may have meant.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compressed_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RecallOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            tokens: None,
            source: None,
            error: Some(error.into()),
            compressed_keys: Vec::new(),
            note: None,
        }
    }
}

/// Input to [`ContextManager::add_message`].
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
}

/// Token-budgeted conversation store with transparent compression.
pub struct ContextManager {
    storage: SessionStorage,
    bus: Arc<EventBus>,
    budget_config: BudgetConfig,
    session: Option<Session>,
    system_prompt_tokens: usize,
    turn_counters: HashMap<String, u32>,
}

impl ContextManager {
    pub fn new(storage: SessionStorage, budget_config: BudgetConfig, bus: Arc<EventBus>) -> Self {
        Self {
            storage,
            bus,
            budget_config,
            session: None,
            system_prompt_tokens: 0,
            turn_counters: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Create a fresh session with zero totals.
    pub fn init_session(&mut self, query: &str, working_dir: &Path) -> Result<(), ContextError> {
        let session = Session {
            id: new_session_id(),
            query: query.to_string(),
            started_at: helpers::timestamp(),
            working_dir: working_dir.to_path_buf(),
            messages: Vec::new(),
            total_tokens: 0,
            storage: Default::default(),
            budget: self.budget_config.clone(),
        };
        self.storage.create_session(&session)?;
        self.system_prompt_tokens = 0;
        self.turn_counters.clear();
        self.session = Some(session);
        Ok(())
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.session.as_ref().map(|s| s.working_dir.clone())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message: allocate a key, estimate tokens, preserve the
    /// original when compressible, update totals, and compress when the
    /// budget trigger fires.
    pub fn add_message(&mut self, new: NewMessage) -> Result<Message, ContextError> {
        if self.session.is_none() {
            return Err(ContextError::NoActiveSession);
        }

        let mut msg = Message {
            key: new_message_key(),
            role: new.role,
            content: new.content,
            tokens: 0,
            compressed: false,
            original_tokens: None,
            timestamp: helpers::timestamp(),
            metadata: new.metadata,
        };
        msg.tokens = estimate_tokens(&msg.content);

        if is_compressible(&msg) {
            let sid = self.session.as_ref().unwrap().id.clone();
            match self.storage.save_message_content(&sid, &msg) {
                Ok(path) => {
                    self.session
                        .as_mut()
                        .unwrap()
                        .storage
                        .messages
                        .insert(msg.key.clone(), path);
                }
                Err(e) => {
                    // Without a preserved original there is nothing to recall,
                    // so the message must stay uncompressed.
                    warn!("failed to preserve message original: {}", e);
                    msg.metadata.compressible = Some(false);
                }
            }
        }

        {
            let session = self.session.as_mut().unwrap();
            session.messages.push(msg.clone());
            session.total_tokens += msg.tokens;
        }

        if self.used_ratio() >= TRIGGER_RATIO {
            self.run_compression();
        }

        if let Err(e) = self.save() {
            warn!("failed to persist session metadata: {}", e);
        }

        Ok(msg)
    }

    /// Ordered `(role, content)` pairs, post compression.
    pub fn messages_for_llm(&self) -> Vec<ChatMessage> {
        self.session
            .as_ref()
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| ChatMessage {
                        role: m.role.as_str().to_string(),
                        content: m.content.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keyed message snapshots for turn debug records.
    pub fn message_snapshots(&self) -> Vec<TurnMessage> {
        self.session
            .as_ref()
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| TurnMessage {
                        key: m.key.clone(),
                        role: m.role,
                        content: m.content.clone(),
                        compressed: m.compressed,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Filtered projection for the synthesis phase.
    ///
    /// Drops failed-tool noise (`执行失败` / `错误:` markers) and the bulky
    /// list_dir/ripgrep results; keeps assistant messages, the original
    /// query, and every other tool result.
    pub fn messages_for_synthesis(&self) -> Vec<SynthesisMessage> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        session
            .messages
            .iter()
            .filter(|m| {
                if m.content.contains("执行失败") || m.content.contains("错误:") {
                    return false;
                }
                if let Some(tool) = m.metadata.tool_name.as_deref() {
                    return tool != "list_dir" && tool != "ripgrep";
                }
                match m.role {
                    Role::Assistant => true,
                    Role::User => m.metadata.is_empty(),
                }
            })
            .map(|m| SynthesisMessage {
                key: m.key.clone(),
                role: m.role,
                content: m.content.clone(),
                tool_name: m.metadata.tool_name.clone(),
                source: m.metadata.source.clone(),
                compressed: m.compressed,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Budget
    // -----------------------------------------------------------------------

    pub fn set_system_prompt_tokens(&mut self, tokens: usize) {
        self.system_prompt_tokens = tokens;
    }

    pub fn budget_state(&self) -> BudgetState {
        let message_tokens = self.session.as_ref().map(|s| s.total_tokens).unwrap_or(0);
        BudgetState::compute(&self.budget_config, self.system_prompt_tokens, message_tokens)
    }

    fn used_tokens(&self) -> usize {
        self.system_prompt_tokens + self.session.as_ref().map(|s| s.total_tokens).unwrap_or(0)
    }

    fn used_ratio(&self) -> f64 {
        let total = self.budget_config.context_window;
        if total == 0 {
            return 0.0;
        }
        self.used_tokens() as f64 / total as f64
    }

    // -----------------------------------------------------------------------
    // Compression
    // -----------------------------------------------------------------------

    fn run_compression(&mut self) {
        let target = (self.budget_config.context_window as f64 * TARGET_RATIO) as usize;
        let used_before = self.used_tokens();

        let candidates = self.compression_candidates();
        let mut compressed_count = 0usize;
        let mut tokens_freed = 0usize;
        for idx in candidates {
            if self.used_tokens() <= target {
                break;
            }
            tokens_freed += self.compress_at(idx);
            compressed_count += 1;
        }

        if compressed_count > 0 {
            debug!(
                "compressed {} messages, freed ~{} tokens ({} -> {})",
                compressed_count,
                tokens_freed,
                used_before,
                self.used_tokens()
            );
            self.bus.emit(AgentEvent::Compression {
                messages_compressed: compressed_count,
                tokens_freed,
                used_before,
                used_after: self.used_tokens(),
            });
        }

        // Eviction fallback: discard oldest messages outside the protected
        // tail until the target is reached.
        if self.used_tokens() > target {
            let mut discarded = 0usize;
            let mut freed = 0usize;
            while self.used_tokens() > target {
                let session = self.session.as_mut().unwrap();
                if session.messages.len() <= PROTECTED_RECENT_MESSAGES {
                    break;
                }
                let removed = session.messages.remove(0);
                session.total_tokens -= removed.tokens;
                discarded += 1;
                freed += removed.tokens;
            }
            if discarded > 0 {
                warn!("discarded {} oldest messages, freed {} tokens", discarded, freed);
                self.bus.emit(AgentEvent::MessagesDiscarded {
                    count: discarded,
                    tokens_freed: freed,
                });
            }
        }
    }

    /// Candidate indices ordered by priority, then savings descending.
    fn compression_candidates(&self) -> Vec<usize> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let protected_from = session
            .messages
            .len()
            .saturating_sub(PROTECTED_RECENT_MESSAGES);

        let mut candidates: Vec<(CompressPriority, usize, usize)> = session.messages
            [..protected_from]
            .iter()
            .enumerate()
            .filter(|(_, m)| is_compressible(m))
            .map(|(idx, m)| {
                let estimated = estimated_compressed_tokens(m);
                let savings = m.tokens.saturating_sub(estimated);
                (compress_priority(m), savings, idx)
            })
            .collect();

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        candidates.into_iter().map(|(_, _, idx)| idx).collect()
    }

    /// Replace the message body at `idx` with a placeholder. Returns the
    /// tokens freed.
    fn compress_at(&mut self, idx: usize) -> usize {
        let placeholder = {
            let msg = &self.session.as_ref().unwrap().messages[idx];
            placeholder_content(msg)
        };
        let new_tokens = estimate_tokens(&placeholder);

        let session = self.session.as_mut().unwrap();
        let msg = &mut session.messages[idx];
        let old_tokens = msg.tokens;
        msg.original_tokens = Some(old_tokens);
        msg.compressed = true;
        msg.content = placeholder;
        msg.tokens = new_tokens;
        session.total_tokens = session.total_tokens - old_tokens + new_tokens;
        old_tokens.saturating_sub(new_tokens)
    }

    // -----------------------------------------------------------------------
    // Recall
    // -----------------------------------------------------------------------

    /// Resolve a recall request. Read-only: never mutates the conversation,
    /// totals, or budget.
    pub fn recall(&self, key: &str) -> RecallOutcome {
        let Some(session) = self.session.as_ref() else {
            return RecallOutcome::failure("没有活动会话，无法召回消息");
        };

        let Some(msg) = session.messages.iter().find(|m| m.key == key) else {
            let compressed_keys: Vec<String> = session
                .messages
                .iter()
                .filter(|m| m.compressed)
                .take(RECALL_HINT_KEYS)
                .map(|m| m.key.clone())
                .collect();
            self.bus.emit(AgentEvent::Recall {
                key: key.to_string(),
                success: false,
                tokens_recalled: 0,
            });
            let mut outcome =
                RecallOutcome::failure(format!("未找到 key 为 \"{}\" 的消息", key));
            outcome.compressed_keys = compressed_keys;
            return outcome;
        };

        if !msg.compressed {
            self.bus.emit(AgentEvent::Recall {
                key: key.to_string(),
                success: true,
                tokens_recalled: 0,
            });
            return RecallOutcome {
                success: true,
                content: Some(msg.content.clone()),
                tokens: Some(msg.tokens),
                source: msg.metadata.source.clone(),
                error: None,
                compressed_keys: Vec::new(),
                note: Some("该消息未被压缩，以下为当前内容".to_string()),
            };
        }

        match self.storage.load_message_content(&session.id, key) {
            Ok(original) => {
                self.bus.emit(AgentEvent::Recall {
                    key: key.to_string(),
                    success: true,
                    tokens_recalled: original.tokens,
                });
                RecallOutcome {
                    success: true,
                    content: Some(original.content),
                    tokens: Some(original.tokens),
                    source: original.metadata.source,
                    error: None,
                    compressed_keys: Vec::new(),
                    note: None,
                }
            }
            Err(e) => {
                self.bus.emit(AgentEvent::Recall {
                    key: key.to_string(),
                    success: false,
                    tokens_recalled: 0,
                });
                RecallOutcome::failure(format!("召回原文失败: {}", e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Persist session metadata.
    pub fn save(&self) -> Result<(), ContextError> {
        match self.session.as_ref() {
            Some(session) => self.storage.save_session(session),
            None => Err(ContextError::NoActiveSession),
        }
    }

    /// Persist one LLM turn record with a per-agent sequence number.
    pub fn save_llm_turn(&mut self, turn: &LLMTurn) -> Result<(), ContextError> {
        let sid = self
            .session
            .as_ref()
            .ok_or(ContextError::NoActiveSession)?
            .id
            .clone();
        let counter = self.turn_counters.entry(turn.agent.clone()).or_insert(0);
        *counter += 1;
        let seq = *counter;
        self.storage.save_turn(&sid, turn, seq)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compression helpers
// ---------------------------------------------------------------------------

/// A message is compressible iff it is not already compressed, not marked
/// `compressible=false`, and either carries a tool name or is large.
fn is_compressible(msg: &Message) -> bool {
    if msg.compressed {
        return false;
    }
    if msg.metadata.compressible == Some(false) {
        return false;
    }
    msg.metadata.tool_name.is_some() || msg.tokens >= MIN_TOKENS_TO_COMPRESS
}

fn compress_priority(msg: &Message) -> CompressPriority {
    if let Some(tool) = msg.metadata.tool_name.as_deref() {
        if tool == "read_file" || tool == "ripgrep" {
            return CompressPriority::High;
        }
        return CompressPriority::Medium;
    }
    if msg.role == Role::Assistant {
        return CompressPriority::Low;
    }
    CompressPriority::Medium
}

fn estimated_compressed_tokens(msg: &Message) -> usize {
    let ratio = if msg.metadata.tool_name.is_some() {
        TOOL_RESULT_COMPRESS_RATIO
    } else {
        DEFAULT_COMPRESS_RATIO
    };
    ((msg.tokens as f64 * ratio).ceil() as usize).max(COMPRESSED_FLOOR_TOKENS)
}

/// Build the placeholder that replaces a compressed message body.
fn placeholder_content(msg: &Message) -> String {
    let key = &msg.key;
    let hint = format!("如需完整内容，使用 recall_detail(key=\"{}\")", key);

    match (msg.metadata.tool_name.as_deref(), msg.metadata.source.as_deref()) {
        (Some("read_file"), Some(source)) => {
            let line_count = msg.content.lines().count();
            let (symbols, total) = extract_symbols(&msg.content);
            let mut symbol_part = symbols.join(",");
            if total > symbols.len() {
                symbol_part.push_str(&format!(" [等{}个符号]", total));
            }
            format!(
                "[COMPRESSED:{}] 文件 {} ({}行) 包含: {}\n{}",
                key, source, line_count, symbol_part, hint
            )
        }
        (Some("ripgrep"), _) => {
            let matches = msg.content.matches('\n').count();
            format!("[COMPRESSED:{}] 搜索结果 ({}个匹配)\n{}", key, matches, hint)
        }
        _ => {
            let snippet: String = msg
                .content
                .chars()
                .take(SNIPPET_CHARS)
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            format!("[COMPRESSED:{}] {}...\n{}", key, snippet, hint)
        }
    }
}

/// Identifier-after-keyword scan for function/class/type/interface/def
/// names. Returns up to [`MAX_PLACEHOLDER_SYMBOLS`] names and the total
/// count found.
fn extract_symbols(content: &str) -> (Vec<String>, usize) {
    let mut seen: Vec<String> = Vec::new();
    for caps in SYMBOL_RE.captures_iter(content) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    let total = seen.len();
    seen.truncate(MAX_PLACEHOLDER_SYMBOLS);
    (seen, total)
}
