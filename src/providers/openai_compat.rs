//! OpenAI-compatible API client.
//!
//! Talks to any chat-completions endpoint (DeepSeek, OpenAI, OpenRouter,
//! Groq, vLLM, ...) via reqwest. Tool schemas arrive in the flat wire form
//! `{name, description, parameters}` and are wrapped into the
//! `{type: "function", function: {...}}` envelope this API expects.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::base::{
    ChatMessage, CompletionOptions, CompletionResponse, LLMClient, TokenUsage, ToolCall,
};
use super::retry::{adjust_for_rate_limit, provider_backoff};
use crate::errors::ProviderError;

/// Client for OpenAI-compatible chat completions endpoints.
pub struct OpenAiCompatClient {
    api_key: String,
    api_base: String,
    default_model: String,
    client: Client,
}

impl OpenAiCompatClient {
    /// Create a new client.
    ///
    /// Endpoint detection when `api_base` is not given:
    /// - `sk-or-` key prefix → OpenRouter
    /// - model containing `deepseek` → DeepSeek
    /// - `gsk_` key prefix → Groq
    /// - otherwise → OpenAI
    pub fn new(api_key: &str, api_base: Option<&str>, model: &str) -> Self {
        let resolved_base = if let Some(base) = api_base {
            base.trim_end_matches('/').to_string()
        } else if api_key.starts_with("sk-or-") {
            "https://openrouter.ai/api/v1".to_string()
        } else if model.contains("deepseek") {
            "https://api.deepseek.com".to_string()
        } else if api_key.starts_with("gsk_") {
            "https://api.groq.com/openai/v1".to_string()
        } else {
            "https://api.openai.com/v1".to_string()
        };

        Self {
            api_key: api_key.to_string(),
            api_base: resolved_base,
            default_model: model.to_string(),
            client: Client::new(),
        }
    }

    fn build_body(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut wire_messages: Vec<Value> = Vec::new();
        if let Some(system) = &options.system_prompt {
            wire_messages.push(json!({"role": "system", "content": system}));
        }
        for msg in messages {
            wire_messages.push(json!({"role": msg.role, "content": msg.content}));
        }

        let mut body = json!({
            "model": self.default_model,
            "messages": wire_messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        if !options.tools.is_empty() {
            let tool_defs: Vec<Value> = options
                .tools
                .iter()
                .map(|t| json!({"type": "function", "function": t}))
                .collect();
            body["tools"] = Value::Array(tool_defs);
            body["tool_choice"] = json!("auto");
        }

        body
    }

    async fn request_once(&self, body: &Value) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Unknown(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Unknown(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), retry_after, &text));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Unknown(format!("failed to parse response JSON: {}", e)))?;
        Ok(parse_response(&data))
    }
}

/// Map an HTTP error status to a typed provider error.
fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> ProviderError {
    let message = truncate_body(body);
    match status {
        401 | 403 => ProviderError::AuthError { status, message },
        408 => ProviderError::Timeout(message),
        429 => ProviderError::RateLimit {
            status,
            retry_after_secs: retry_after.unwrap_or(5),
        },
        400 | 413 => {
            let lower = body.to_lowercase();
            if lower.contains("context length")
                || lower.contains("context_length")
                || lower.contains("maximum context")
                || lower.contains("too many tokens")
            {
                ProviderError::ContextOverflow(message)
            } else {
                ProviderError::InvalidRequest { status, message }
            }
        }
        500..=599 => ProviderError::ServiceUnavailable { status, message },
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status, message)),
    }
}

fn truncate_body(body: &str) -> String {
    crate::utils::helpers::truncate_string(body, 300)
}

/// Parse a chat-completions response document.
fn parse_response(data: &Value) -> CompletionResponse {
    let message = &data["choices"][0]["message"];

    let content = message["content"].as_str().unwrap_or("").to_string();
    // DeepSeek-style reasoning channel.
    let thinking = message["reasoning_content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from);

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            let arguments: HashMap<String, Value> = call["function"]["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            tool_calls.push(ToolCall { name, arguments });
        }
    }

    let usage = data.get("usage").map(|u| {
        let cached = u["prompt_cache_hit_tokens"]
            .as_u64()
            .or_else(|| u["cached_tokens"].as_u64());
        TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            cache_hit: cached.map(|c| c > 0),
            cached_tokens: cached,
        }
    });

    CompletionResponse {
        content,
        tool_calls,
        usage,
        thinking,
    }
}

#[async_trait]
impl LLMClient for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let body = self.build_body(messages, options);
        debug!(
            "chat completion: model={}, messages={}, tools={}",
            self.default_model,
            messages.len(),
            options.tools.len()
        );

        let response = (|| async { self.request_once(&body).await })
            .retry(provider_backoff())
            .when(|e: &ProviderError| e.recoverable())
            .adjust(adjust_for_rate_limit)
            .notify(|err: &ProviderError, dur| {
                warn!("LLM request failed ({}), retrying in {:?}", err, dur);
            })
            .await?;

        Ok(response)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
