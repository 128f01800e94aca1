//! Provider-agnostic LLM client interface.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single conversation message on the LLM wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A tool call requested by the model. Arguments arrive as a parsed map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub thinking: Option<String>,
}

impl CompletionResponse {
    /// Check if the response contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// System prompt sent alongside (not inside) the message list.
    pub system_prompt: Option<String>,
    /// Tool schemas in wire form: `{name, description, parameters}`.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// When set, enable extended thinking with this token budget.
    pub thinking_budget: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: 8192,
            temperature: 0.3,
            thinking_budget: None,
        }
    }
}

/// Abstract capability for LLM clients.
///
/// Implementations handle the specifics of each provider's API while
/// maintaining a consistent interface. Errors are reported as
/// [`crate::errors::ProviderError`] embedded in `anyhow::Error`.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a completion request and wait for the full response.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse>;

    /// Get the default model for this client.
    fn default_model(&self) -> &str;
}
