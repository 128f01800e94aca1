//! The synthesizer: turns the filtered transcript into a final report.
//!
//! Single-shot generation with a bounded recall loop: when any input
//! message is compressed, the model may call `recall_detail` up to
//! `max_recall_iterations` times before the report must be produced.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::agent::context::ContextManager;
use crate::agent::decision::Decision;
use crate::agent::message::{LLMTurn, SynthesisMessage, TurnInput, TurnOutput};
use crate::agent::prompts;
use crate::bus::events::{AgentEvent, EventBus};
use crate::providers::base::{ChatMessage, CompletionOptions, LLMClient};
use crate::utils::helpers;

const DEFAULT_MAX_RECALL_ITERATIONS: u32 = 3;
/// Key files listed in the closing instruction before eliding.
const MAX_LISTED_KEY_FILES: usize = 20;

/// Report plus accumulated token totals.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub report: String,
    pub tokens_used: u64,
}

/// Report generator with a bounded recall tool loop.
pub struct Synthesizer {
    client: Arc<dyn LLMClient>,
    bus: Arc<EventBus>,
    max_recall_iterations: u32,
    max_tokens: u32,
    temperature: f64,
}

impl Synthesizer {
    pub fn new(client: Arc<dyn LLMClient>, bus: Arc<EventBus>) -> Self {
        Self {
            client,
            bus,
            max_recall_iterations: DEFAULT_MAX_RECALL_ITERATIONS,
            max_tokens: 8192,
            temperature: 0.3,
        }
    }

    /// Override sampling parameters (from provider config).
    pub fn with_sampling(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Generate the report. Fails only when the LLM call itself fails.
    pub async fn run(
        &self,
        query: &str,
        messages: &[SynthesisMessage],
        key_files: &[String],
        ctx: &mut ContextManager,
    ) -> anyhow::Result<SynthesisOutput> {
        self.bus.emit(AgentEvent::SynthesisStart {});

        let mut chat: Vec<ChatMessage> =
            vec![ChatMessage::user(format!("用户问题: {}", query))];
        chat.extend(messages.iter().map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));
        chat.push(ChatMessage::user(closing_instruction(key_files)));

        let has_compressed = messages.iter().any(|m| m.compressed);
        let (tools, max_iterations) = if has_compressed {
            (
                vec![crate::agent::investigator::recall_detail_definition()],
                self.max_recall_iterations,
            )
        } else {
            (Vec::new(), 1)
        };

        let options = CompletionOptions {
            system_prompt: Some(prompts::SYNTHESIZER_TEMPLATE.to_string()),
            tools,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            thinking_budget: None,
        };

        let mut tokens_used: u64 = 0;
        for iteration in 1..=max_iterations {
            let started_at = helpers::timestamp();
            let turn_start = Instant::now();
            let response = match self.client.complete(&chat, &options).await {
                Ok(r) => r,
                Err(e) => {
                    self.bus.emit(AgentEvent::SynthesisError {
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };
            if let Some(usage) = &response.usage {
                tokens_used += usage.total();
            }

            let recall_call = response
                .tool_calls
                .iter()
                .find(|tc| tc.name == "recall_detail")
                .cloned();

            let decision = match &recall_call {
                Some(tc) => Decision::ToolCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
                None => Decision::Done {
                    result: response.content.clone(),
                },
            };
            let turn = LLMTurn {
                agent: "synthesizer".to_string(),
                iteration,
                input: TurnInput {
                    system_prompt: prompts::SYNTHESIZER_TEMPLATE.to_string(),
                    messages: Vec::new(),
                    tools: options.tools.clone(),
                },
                output: TurnOutput {
                    content: response.content.clone(),
                    thinking: response.thinking.clone(),
                    tool_calls: response.tool_calls.clone(),
                },
                usage: response.usage.clone(),
                decision,
                tool_result: None,
                started_at,
                duration_ms: turn_start.elapsed().as_millis() as u64,
            };
            if let Err(e) = ctx.save_llm_turn(&turn) {
                warn!("failed to persist synthesis turn: {}", e);
            }

            if let Some(tc) = recall_call {
                let key = tc
                    .arguments
                    .get("key")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                debug!("synthesis recall iteration {}: key={}", iteration, key);

                let assistant_text = if response.content.trim().is_empty() {
                    format!("调用 recall_detail(key=\"{}\")", key)
                } else {
                    response.content.clone()
                };
                chat.push(ChatMessage::assistant(assistant_text));

                let outcome = ctx.recall(&key);
                let result_text = if outcome.success {
                    format!("召回成功:\n\n{}", outcome.content.unwrap_or_default())
                } else {
                    format!(
                        "召回失败: {}",
                        outcome.error.unwrap_or_else(|| "未知原因".to_string())
                    )
                };
                chat.push(ChatMessage::user(result_text));
                continue;
            }

            let report = ensure_proper_format(&response.content);
            self.bus.emit(AgentEvent::SynthesisComplete { tokens_used });
            return Ok(SynthesisOutput {
                report,
                tokens_used,
            });
        }

        // Recall budget exhausted without a final answer.
        self.bus.emit(AgentEvent::SynthesisComplete { tokens_used });
        Ok(SynthesisOutput {
            report: "## 分析结果\n\n达到最大召回次数限制，无法生成完整报告。".to_string(),
            tokens_used,
        })
    }
}

/// Closing user message: key files plus the heading-first instruction.
fn closing_instruction(key_files: &[String]) -> String {
    let mut text = String::new();
    if !key_files.is_empty() {
        let shown: Vec<&str> = key_files
            .iter()
            .take(MAX_LISTED_KEY_FILES)
            .map(|s| s.as_str())
            .collect();
        text.push_str(&format!("调查中涉及的重点文件: {}", shown.join(", ")));
        if key_files.len() > MAX_LISTED_KEY_FILES {
            text.push_str(&format!(" … 等{} 个文件", key_files.len()));
        }
        text.push_str("\n\n");
    }
    text.push_str("请基于以上调查内容撰写分析报告，直接以 Markdown 标题开始，不要有任何前言。");
    text
}

/// Normalize the report so it starts with a Markdown heading.
pub fn ensure_proper_format(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.starts_with('#') {
        return trimmed.to_string();
    }

    // A heading further down: discard the preamble before it.
    let mut offset = 0usize;
    for line in trimmed.split_inclusive('\n') {
        if offset > 0 && line.starts_with('#') {
            return trimmed[offset..].trim_end().to_string();
        }
        offset += line.len();
    }

    format!("## 分析结果\n\n{}", trimmed)
}
