//! The investigator: a ReAct loop over model turns and tool executions.
//!
//! Each iteration calls the model once, classifies the response into a
//! [`Decision`], acts on it, and feeds corrective messages back into the
//! conversation when the model misbehaves (text-form tool calls, skipped
//! self-check, fabricated tool results, repeated identical calls).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::context::{ContextManager, NewMessage, RecallOutcome};
use crate::agent::decision::{self, Decision};
use crate::agent::estimator::estimate_tokens;
use crate::agent::message::{
    LLMTurn, MessageMetadata, Role, TurnInput, TurnOutput, TurnToolResult,
};
use crate::agent::prompts;
use crate::agent::tools::{ToolContext, ToolOutcome, ToolRegistry};
use crate::bus::events::{AgentEvent, EventBus};
use crate::config::schema::AgentConfig;
use crate::errors::{AgentError, ProviderError};
use crate::providers::base::{CompletionOptions, LLMClient};
use crate::utils::helpers;

const INVALID_TOOL_CALL_FEEDBACK: &str =
    "请通过函数调用（tool use）接口执行工具，不要在文本中描述工具调用。";
const THINKING_FEEDBACK: &str =
    "请调用工具继续调查；如果调查已经完成，先调用 think 工具自检，然后输出 [INVESTIGATION_COMPLETE]。";
const SELF_CHECK_FEEDBACK: &str =
    "必须先完成自检才能结束调查。请先调用 think 工具核对你的结论是否都有工具结果支持，再输出 [INVESTIGATION_COMPLETE]。";
const HALLUCINATION_FEEDBACK: &str =
    "检测到你在回复中伪造了工具执行结果。工具只能通过函数调用（tool use）接口执行，请重新发起真实的工具调用。";

/// Extensions scanned for in tool outputs when tracking key files.
static SOURCE_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[A-Za-z0-9_\-./]+\.(?:tsx|jsx|ts|js|go|py|java|rs|rb|cpp|vue|svelte|c|h)\b",
    )
    .unwrap()
});

/// Max key files harvested from a single tool result.
const MAX_KEY_FILES_PER_RESULT: usize = 10;

/// Terminal state of an investigation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigatorStatus {
    Running,
    Completed,
    Error,
    Stuck,
}

impl InvestigatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigatorStatus::Running => "running",
            InvestigatorStatus::Completed => "completed",
            InvestigatorStatus::Error => "error",
            InvestigatorStatus::Stuck => "stuck",
        }
    }
}

/// What an investigation run produced.
#[derive(Debug, Clone)]
pub struct InvestigationOutcome {
    pub success: bool,
    pub findings: String,
    pub iterations: u32,
    pub decisions: Vec<Decision>,
    pub thinking: Vec<String>,
    pub key_files: Vec<String>,
    pub status: InvestigatorStatus,
    pub total_tokens: u64,
    pub error: Option<String>,
}

/// The ReAct loop controller.
pub struct Investigator {
    client: Arc<dyn LLMClient>,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    config: AgentConfig,
    max_tokens: u32,
    temperature: f64,
    cancel: CancellationToken,
}

impl Investigator {
    pub fn new(
        client: Arc<dyn LLMClient>,
        registry: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        config: AgentConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            registry,
            bus,
            config,
            max_tokens: 8192,
            temperature: 0.3,
            cancel,
        }
    }

    /// Override sampling parameters (from provider config).
    pub fn with_sampling(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Tool schemas advertised to the model: registry tools plus the
    /// context-backed `recall_detail` handler.
    fn tool_definitions(&self) -> Vec<Value> {
        let mut defs = self.registry.definitions();
        defs.push(recall_detail_definition());
        defs
    }

    /// Run the loop to completion. Never panics or escapes an error: the
    /// outcome carries the terminal state.
    pub async fn run(&self, query: &str, ctx: &mut ContextManager) -> InvestigationOutcome {
        let session_id = ctx.session_id().unwrap_or_default().to_string();
        self.bus.emit(AgentEvent::SessionStart {
            session_id: session_id.clone(),
            query: query.to_string(),
        });

        let mut decisions: Vec<Decision> = Vec::new();
        let mut thinking_log: Vec<String> = Vec::new();
        let mut key_files: Vec<String> = Vec::new();
        let mut last_tool_results: HashMap<String, String> = HashMap::new();
        let mut total_tokens: u64 = 0;
        let mut status = InvestigatorStatus::Running;
        let mut findings = String::new();
        let mut error: Option<String> = None;

        // Seed the conversation with the plain user query.
        if let Err(e) = ctx.add_message(NewMessage {
            role: Role::User,
            content: query.to_string(),
            metadata: MessageMetadata::default(),
        }) {
            return InvestigationOutcome {
                success: false,
                findings: String::new(),
                iterations: 0,
                decisions,
                thinking: thinking_log,
                key_files,
                status: InvestigatorStatus::Error,
                total_tokens,
                error: Some(e.to_string()),
            };
        }

        let tool_defs = self.tool_definitions();
        let mut known_tools: Vec<String> = self.registry.names();
        known_tools.push("recall_detail".to_string());
        let system_prompt =
            prompts::investigator_system_prompt(&prompts::tool_catalog(&tool_defs));
        let system_prompt_tokens = estimate_tokens(&system_prompt);

        let thinking_budget = if self.config.enable_thinking {
            self.config.thinking_budget
        } else {
            None
        };

        let mut iteration: u32 = 0;
        while iteration < self.config.max_iterations {
            iteration += 1;

            if self.cancel.is_cancelled() {
                status = InvestigatorStatus::Error;
                error = Some("Aborted".to_string());
                break;
            }

            ctx.set_system_prompt_tokens(system_prompt_tokens);
            self.bus.emit(AgentEvent::IterationStart {
                iteration,
                max_iterations: self.config.max_iterations,
                budget: ctx.budget_state(),
            });

            let messages = ctx.messages_for_llm();
            let input_snapshot = TurnInput {
                system_prompt: system_prompt.clone(),
                messages: ctx.message_snapshots(),
                tools: tool_defs.clone(),
            };
            let options = CompletionOptions {
                system_prompt: Some(system_prompt.clone()),
                tools: tool_defs.clone(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                thinking_budget,
            };

            let started_at = helpers::timestamp();
            let turn_start = Instant::now();
            let response = tokio::select! {
                _ = self.cancel.cancelled() => {
                    status = InvestigatorStatus::Error;
                    error = Some("Aborted".to_string());
                    break;
                }
                result = self.client.complete(&messages, &options) => result,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let recoverable = e
                        .downcast_ref::<ProviderError>()
                        .map(|p| p.recoverable())
                        .unwrap_or(false);
                    self.bus.emit(AgentEvent::Error {
                        error: e.to_string(),
                        recoverable,
                        retrying: false,
                    });
                    status = InvestigatorStatus::Error;
                    error = Some(AgentError::LlmError(e.to_string()).to_string());
                    break;
                }
            };

            if let Some(usage) = &response.usage {
                total_tokens += usage.total();
            }

            let decision = decision::parse_decision(&response, &decisions, &known_tools);
            debug!("iteration {} decision: {}", iteration, decision.kind());
            decisions.push(decision.clone());

            if let Some(thinking) = &response.thinking {
                thinking_log.push(thinking.clone());
                self.bus.emit(AgentEvent::Thinking {
                    content: thinking.clone(),
                });
            }

            let mut turn_tool_result: Option<TurnToolResult> = None;
            let mut finished = false;

            match &decision {
                Decision::ToolCall { name, arguments } => {
                    self.bus.emit(AgentEvent::ToolCall {
                        name: name.clone(),
                        arguments: json!(arguments),
                    });

                    let tool_start = Instant::now();
                    let outcome = self.execute_tool(name, arguments, ctx).await;
                    let duration_ms = tool_start.elapsed().as_millis() as u64;

                    self.bus.emit(AgentEvent::ToolResult {
                        name: name.clone(),
                        result: outcome.output.clone(),
                        duration_ms,
                    });

                    // Assistant message: the scrubbed original text, or a
                    // fallback when the text was entirely fabricated.
                    let scrubbed = decision::scrub_content(&response.content);
                    let assistant_text = if scrubbed.trim().is_empty() {
                        format!("调用 {} 工具", name)
                    } else {
                        scrubbed
                    };
                    self.append(ctx, Role::Assistant, assistant_text, MessageMetadata::default());

                    let verdict = if outcome.ok { "成功" } else { "失败" };
                    let source = arguments
                        .get("path")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    self.append(
                        ctx,
                        Role::User,
                        format!("工具 \"{}\" 执行{}:\n\n{}", name, verdict, outcome.output),
                        MessageMetadata::tool_result(name, source),
                    );

                    track_key_files(&mut key_files, name, arguments, &outcome.output);
                    last_tool_results.insert(name.clone(), outcome.output.clone());
                    turn_tool_result = Some(TurnToolResult {
                        name: name.clone(),
                        ok: outcome.ok,
                        output: outcome.output.clone(),
                        duration_ms,
                    });
                }
                Decision::InvalidToolCall { content, .. } => {
                    if !content.trim().is_empty() {
                        self.append(ctx, Role::Assistant, content.clone(), MessageMetadata::default());
                    }
                    self.append(
                        ctx,
                        Role::User,
                        INVALID_TOOL_CALL_FEEDBACK.to_string(),
                        MessageMetadata::protected(),
                    );
                }
                Decision::Thinking { content } => {
                    if !content.trim().is_empty() {
                        self.append(ctx, Role::Assistant, content.clone(), MessageMetadata::default());
                    }
                    self.append(
                        ctx,
                        Role::User,
                        THINKING_FEEDBACK.to_string(),
                        MessageMetadata::protected(),
                    );
                }
                Decision::RequiresSelfCheck { content } => {
                    if !content.trim().is_empty() {
                        self.append(ctx, Role::Assistant, content.clone(), MessageMetadata::default());
                    }
                    self.append(
                        ctx,
                        Role::User,
                        SELF_CHECK_FEEDBACK.to_string(),
                        MessageMetadata::protected(),
                    );
                }
                Decision::HallucinationDetected {
                    cleaned_content, ..
                } => {
                    if !cleaned_content.is_empty() {
                        self.append(
                            ctx,
                            Role::Assistant,
                            cleaned_content.clone(),
                            MessageMetadata::default(),
                        );
                    }
                    self.append(
                        ctx,
                        Role::User,
                        HALLUCINATION_FEEDBACK.to_string(),
                        MessageMetadata::protected(),
                    );
                }
                Decision::Done { result } => {
                    self.append(ctx, Role::Assistant, result.clone(), MessageMetadata::default());
                    findings = decision::extract_findings(result);
                    status = InvestigatorStatus::Completed;
                    finished = true;
                    self.bus.emit(AgentEvent::Done {
                        result: findings.clone(),
                    });
                }
            }

            let turn = LLMTurn {
                agent: "investigator".to_string(),
                iteration,
                input: input_snapshot,
                output: TurnOutput {
                    content: response.content.clone(),
                    thinking: response.thinking.clone(),
                    tool_calls: response.tool_calls.clone(),
                },
                usage: response.usage.clone(),
                decision: decision.clone(),
                tool_result: turn_tool_result,
                started_at,
                duration_ms: turn_start.elapsed().as_millis() as u64,
            };
            if let Err(e) = ctx.save_llm_turn(&turn) {
                warn!("failed to persist turn record: {}", e);
            }

            self.bus.emit(AgentEvent::IterationEnd {
                iteration,
                decision: decision.kind().to_string(),
                tokens_used: total_tokens,
            });

            if finished {
                break;
            }

            // Stuck detection: warn the model and trim the triggering
            // decisions so the next identical call does not re-fire.
            if decision::is_stuck(&decisions, self.config.stuck_threshold) {
                warn!(
                    "stuck loop detected after {} identical tool calls",
                    self.config.stuck_threshold
                );
                self.append(
                    ctx,
                    Role::User,
                    format!(
                        "检测到循环: 你已连续 {} 次发起完全相同的工具调用。请换一个工具或修改参数，或在自检后结束调查。",
                        self.config.stuck_threshold
                    ),
                    MessageMetadata::protected(),
                );
                let keep = decisions.len() - self.config.stuck_threshold;
                decisions.truncate(keep);
            }
        }

        // Out of iterations without a done: exit successfully with whatever
        // the assistant said so far.
        if status == InvestigatorStatus::Running {
            status = InvestigatorStatus::Completed;
            findings = gather_partial_findings(ctx);
            self.bus.emit(AgentEvent::Done {
                result: findings.clone(),
            });
        }

        self.bus.emit(AgentEvent::SessionEnd {
            session_id,
            status: status.as_str().to_string(),
        });

        InvestigationOutcome {
            success: status == InvestigatorStatus::Completed,
            findings,
            iterations: iteration,
            decisions,
            thinking: thinking_log,
            key_files,
            status,
            total_tokens,
            error,
        }
    }

    /// Append a message, logging (not propagating) persistence failures.
    fn append(
        &self,
        ctx: &mut ContextManager,
        role: Role,
        content: String,
        metadata: MessageMetadata,
    ) {
        if let Err(e) = ctx.add_message(NewMessage {
            role,
            content,
            metadata,
        }) {
            warn!("failed to append message: {}", e);
        }
    }

    /// Execute a tool call. `recall_detail` is handled here against the
    /// context manager; everything else goes through the registry.
    async fn execute_tool(
        &self,
        name: &str,
        arguments: &HashMap<String, Value>,
        ctx: &mut ContextManager,
    ) -> ToolOutcome {
        if name == "recall_detail" {
            let key = arguments.get("key").and_then(|v| v.as_str()).unwrap_or("");
            if key.is_empty() {
                return ToolOutcome::failure("缺少 key 参数");
            }
            return recall_to_outcome(ctx.recall(key));
        }

        let working_dir = ctx.working_dir().unwrap_or_else(|| ".".into());
        let tool_ctx = ToolContext {
            working_dir,
            cancellation: self.cancel.child_token(),
        };
        self.registry
            .execute(name, arguments.clone(), &tool_ctx)
            .await
    }
}

/// Wire definition for the context-backed recall handler.
pub fn recall_detail_definition() -> Value {
    json!({
        "name": "recall_detail",
        "description": "按 key 取回一条被压缩消息的完整原文。key 出现在 [COMPRESSED:key] 占位符中，形如 msg_xxxxxxxx。",
        "parameters": {
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "要召回的消息 key"
                }
            },
            "required": ["key"]
        }
    })
}

/// Render a recall outcome as tool output text.
fn recall_to_outcome(outcome: RecallOutcome) -> ToolOutcome {
    if outcome.success {
        let mut text = String::new();
        if let Some(note) = &outcome.note {
            text.push_str(note);
            text.push_str("\n\n");
        }
        if let Some(source) = &outcome.source {
            text.push_str(&format!("来源: {}\n\n", source));
        }
        text.push_str(outcome.content.as_deref().unwrap_or(""));
        ToolOutcome::success(text)
    } else {
        let mut text = outcome.error.unwrap_or_else(|| "召回失败".to_string());
        if !outcome.compressed_keys.is_empty() {
            text.push_str(&format!(
                "。当前已压缩的消息: {}",
                outcome.compressed_keys.join(", ")
            ));
        }
        ToolOutcome::failure(text)
    }
}

/// Record read_file paths and any source-file names appearing in tool
/// output, deduplicated, in first-seen order.
fn track_key_files(
    key_files: &mut Vec<String>,
    tool: &str,
    arguments: &HashMap<String, Value>,
    output: &str,
) {
    if tool == "read_file" {
        if let Some(path) = arguments.get("path").and_then(|v| v.as_str()) {
            push_unique(key_files, path);
        }
    }

    let mut added = 0usize;
    for m in SOURCE_FILE_RE.find_iter(output) {
        if added >= MAX_KEY_FILES_PER_RESULT {
            break;
        }
        if push_unique(key_files, m.as_str()) {
            added += 1;
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

/// Best-effort findings when the iteration cap is hit: bullet lines from
/// assistant messages, else the last assistant content.
fn gather_partial_findings(ctx: &ContextManager) -> String {
    let Some(session) = ctx.session() else {
        return "调查未能得出结论。".to_string();
    };

    let mut bullets: Vec<String> = Vec::new();
    let mut last_assistant: Option<&str> = None;
    for msg in &session.messages {
        if msg.role != Role::Assistant {
            continue;
        }
        last_assistant = Some(&msg.content);
        for line in msg.content.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("• ")
            {
                bullets.push(trimmed.to_string());
            }
        }
    }

    if !bullets.is_empty() {
        return bullets.join("\n");
    }
    last_assistant
        .map(|s| s.to_string())
        .unwrap_or_else(|| "调查未能得出结论。".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_key_files_from_path_arg() {
        let mut files = Vec::new();
        let mut args = HashMap::new();
        args.insert("path".to_string(), json!("src/main.go"));
        track_key_files(&mut files, "read_file", &args, "package main");
        assert_eq!(files, vec!["src/main.go"]);
    }

    #[test]
    fn test_track_key_files_scans_output() {
        let mut files = Vec::new();
        let output = "see handler.ts and util.py plus notes.txt";
        track_key_files(&mut files, "ripgrep", &HashMap::new(), output);
        assert_eq!(files, vec!["handler.ts", "util.py"]);
    }

    #[test]
    fn test_track_key_files_dedup_and_cap() {
        let mut files = Vec::new();
        let output = (0..15)
            .map(|i| format!("f{}.rs", i))
            .collect::<Vec<_>>()
            .join(" ")
            + " f0.rs f1.rs";
        track_key_files(&mut files, "ripgrep", &HashMap::new(), &output);
        assert_eq!(files.len(), MAX_KEY_FILES_PER_RESULT);
        assert_eq!(files[0], "f0.rs");
    }

    #[test]
    fn test_source_file_regex_extension_priority() {
        // .cpp must not be reported as .c, .tsx not as .ts.
        let m = SOURCE_FILE_RE.find("main.cpp rest").unwrap();
        assert_eq!(m.as_str(), "main.cpp");
        let m = SOURCE_FILE_RE.find("app.tsx rest").unwrap();
        assert_eq!(m.as_str(), "app.tsx");
    }

    #[test]
    fn test_source_file_regex_ignores_html() {
        assert!(SOURCE_FILE_RE.find("index.html").is_none());
    }

    #[test]
    fn test_recall_outcome_failure_lists_keys() {
        let outcome = RecallOutcome {
            success: false,
            content: None,
            tokens: None,
            source: None,
            error: Some("未找到 key".into()),
            compressed_keys: vec!["msg_aaaa0000".into(), "msg_bbbb1111".into()],
            note: None,
        };
        let tool_outcome = recall_to_outcome(outcome);
        assert!(!tool_outcome.ok);
        assert!(tool_outcome.output.contains("msg_aaaa0000"));
    }
}
