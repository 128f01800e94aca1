//! Client selection from provider configuration.

use std::sync::Arc;

use crate::config::schema::ProviderConfig;
use crate::providers::anthropic::AnthropicClient;
use crate::providers::base::LLMClient;
use crate::providers::openai_compat::OpenAiCompatClient;

/// Build the LLM client for the configured provider.
///
/// Anthropic is selected when the api base points at anthropic.com or the
/// model is a Claude model; everything else goes through the
/// OpenAI-compatible client.
pub fn create_client(config: &ProviderConfig) -> Arc<dyn LLMClient> {
    let base_is_anthropic = config
        .api_base
        .as_deref()
        .map(|b| b.contains("anthropic.com"))
        .unwrap_or(false);
    let model_is_claude = config.model.starts_with("claude-");

    if base_is_anthropic || model_is_claude {
        Arc::new(AnthropicClient::new(
            &config.api_key,
            config.api_base.as_deref(),
            &config.model,
        ))
    } else {
        Arc::new(OpenAiCompatClient::new(
            &config.api_key,
            config.api_base.as_deref(),
            &config.model,
        ))
    }
}
