//! Generative text service integration.
//!
//! - `provider`: the `LlmProvider` trait the composer talks to
//! - `rig_adapter`: bridges rig-core completion models to `LlmProvider`
//! - `breaker`: circuit breaker decorator that fails fast on a sick provider
//!
//! rig-core carries the HTTP transport; Anthropic is the configured backend.

pub mod breaker;
pub mod provider;
mod rig_adapter;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Per-call deadline the composer applies to each completion.
    pub timeout: Duration,
    pub breaker: BreakerConfig,
}

/// Create the provider stack: Anthropic via rig, behind a circuit breaker.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let anthropic = create_anthropic_provider(config)?;
    Ok(Arc::new(CircuitBreaker::new(
        anthropic,
        config.breaker.clone(),
    )))
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_with_any_key_constructs() {
        // rig clients accept any key at construction; auth fails on first request.
        let config = LlmConfig {
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-3-5-sonnet-latest".to_string(),
            timeout: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "claude-3-5-sonnet-latest");
    }
}
