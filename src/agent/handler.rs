//! What an agent does with a routed request

use crate::error::{DispatchError, DispatchResult};
use crate::llm::provider::{CompletionRequest, LlmProvider};
use crate::protocol::AgentRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Turns one routed request into the text sent back to the user
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, request: &AgentRequest) -> DispatchResult<String>;
}

/// Answers a request with a single LLM call
pub struct LlmAgentHandler {
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

impl LlmAgentHandler {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            max_tokens: 1000,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl AgentHandler for LlmAgentHandler {
    async fn handle(&self, request: &AgentRequest) -> DispatchResult<String> {
        let completion = CompletionRequest::chat(
            &self.model,
            &self.system_prompt,
            request.prompt_text(),
        )
        .with_max_tokens(self.max_tokens);

        let response = self.provider.complete(completion).await?;
        response
            .content
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| DispatchError::classification("agent model returned no content"))
    }
}
