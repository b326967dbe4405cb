//! Model engine implementations for the supported vendors, plus the retry
//! wrapper and the factory consulted at task start and on provider changes.

pub mod anthropic;
pub mod openai;
pub mod retry;

use std::sync::Arc;

use wayfinder_agent::{AgentError, AiProviderType, EngineFactory, ModelEngine};

pub use anthropic::{AnthropicConfig, AnthropicEngine};
pub use openai::{OpenAiConfig, OpenAiEngine};
pub use retry::RetryEngine;

/// Builds retry-wrapped engines for the configured provider.
pub struct ProviderEngineFactory;

impl EngineFactory for ProviderEngineFactory {
    fn build(
        &self,
        provider: AiProviderType,
        api_key: &str,
    ) -> Result<Arc<dyn ModelEngine>, AgentError> {
        let engine: Arc<dyn ModelEngine> = match provider {
            AiProviderType::Anthropic => {
                Arc::new(AnthropicEngine::new(AnthropicConfig::new(api_key))?)
            }
            AiProviderType::OpenAi => Arc::new(OpenAiEngine::new(OpenAiConfig::new(api_key))?),
        };
        Ok(Arc::new(RetryEngine::new(engine)))
    }
}
