//! Intent classifier seam
//!
//! The dispatcher only needs raw classifier text; decoding it into a
//! [`crate::protocol::RoutingDecision`] happens in the dispatcher so a bad
//! response surfaces as a classification error there.

use crate::config::ClassifierSection;
use crate::error::{DispatchError, DispatchResult};
use crate::llm::provider::{CompletionRequest, LlmProvider, ResponseFormat};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Run `text` through the model under `system_prompt` and return its raw reply
    async fn classify(&self, system_prompt: &str, text: &str) -> DispatchResult<String>;
}

/// Classifier backed by a chat-completions model
pub struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, section: &ClassifierSection) -> Self {
        Self {
            provider,
            model: section.model.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, system_prompt: &str, text: &str) -> DispatchResult<String> {
        let request = CompletionRequest::chat(&self.model, system_prompt, text)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_response_format(ResponseFormat::Json);

        let response = self.provider.complete(request).await?;
        let content = response
            .content
            .ok_or_else(|| DispatchError::classification("classifier returned no content"))?;

        debug!(
            "Classifier replied with {} chars via {}",
            content.len(),
            self.provider.name()
        );
        Ok(extract_first_code_block(&content).to_string())
    }
}

static CODE_FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```[\w+-]*[ \t]*\r?\n?(.*?)```").ok());

/// Body of the first fenced code block in `text`, or `text` itself when there is none
pub fn extract_first_code_block(text: &str) -> &str {
    CODE_FENCE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str().trim())
        .unwrap_or_else(|| text.trim())
}
