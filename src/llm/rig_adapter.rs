//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Any rig completion model behind `LlmProvider`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// A request split the way rig wants it.
#[derive(Debug)]
struct Conversation {
    preamble: Option<String>,
    history: Vec<Message>,
    prompt: String,
}

/// System messages become the preamble, the final user message the prompt,
/// and everything in between the chat history.
fn split_messages(provider: &str, messages: &[ChatMessage]) -> Result<Conversation, LlmError> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let prompt = match turns.pop() {
        Some(last) if last.role == Role::User => last.content.clone(),
        _ => {
            return Err(LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: "request must end with a user message".to_string(),
            });
        }
    };

    let history = turns
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::assistant(m.content.clone()),
            _ => Message::user(m.content.clone()),
        })
        .collect();

    Ok(Conversation {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt,
    })
}

/// Classify a rig error by the provider's error text.
fn map_error(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("rate_limit") || lower.contains("429") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("authentication") || lower.contains("401") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let conversation = split_messages(&self.model_name, &request.messages)?;

        let mut builder = self
            .model
            .completion_request(conversation.prompt)
            .messages(conversation.history)
            .max_tokens(u64::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_error(&self.model_name, e.to_string()))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        let input_tokens = u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX);
        let output_tokens = u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX);
        debug!(
            model = %self.model_name,
            input_tokens,
            output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            finish_reason: if content.is_empty() {
                FinishReason::Other
            } else {
                FinishReason::Stop
            },
            content,
            input_tokens,
            output_tokens,
            response_id: None,
        })
    }
}
