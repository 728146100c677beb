//! OpenAI-compatible chat completions
//!
//! Works against any endpoint exposing `POST {base_url}/chat/completions`,
//! including Gemini's OpenAI compatibility layer used by the default config.

use crate::config::ClassifierSection;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, Message,
    ResponseFormat, TokenUsage,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

const RETRY_DELAYS_MS: [u64; 3] = [100, 200, 400];

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl OpenAiConfig {
    pub fn from_section(section: &ClassifierSection, api_key: String) -> Self {
        Self {
            api_key,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured("API key is required".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn build_request(request: &CompletionRequest) -> ChatRequest {
        let response_format = match request.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::Json => Some(ChatResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        ChatRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
        }
    }

    fn parse_response(response: ChatResponse) -> Result<CompletionResponse, LlmError> {
        let Some(choice) = response.choices.into_iter().next() else {
            return Err(LlmError::InvalidResponse("No choices returned".to_string()));
        };

        Ok(CompletionResponse {
            content: choice.message.content,
            model: response.model.unwrap_or_default(),
            usage: response
                .usage
                .map(|u| TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                })
                .unwrap_or_default(),
            finish_reason: Self::finish_reason(choice.finish_reason.as_deref()),
        })
    }

    fn finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    /// Map an HTTP failure status onto an error kind
    fn status_error(status: StatusCode, body: &str) -> LlmError {
        let detail = format!("{status} - {body}");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::AuthenticationFailed(detail)
            }
            StatusCode::NOT_FOUND => LlmError::ModelNotFound(detail),
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimitExceeded(detail),
            s if s.is_server_error() => LlmError::ApiError(format!("server error: {detail}")),
            _ => LlmError::ApiError(detail),
        }
    }

    fn is_retryable(error: &LlmError) -> bool {
        match error {
            LlmError::NetworkError(_) | LlmError::RateLimitExceeded(_) => true,
            LlmError::ApiError(msg) => msg.starts_with("server error"),
            _ => false,
        }
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                LlmError::NetworkError(format!(
                    "{e} (connect: {}, timeout: {})",
                    e.is_connect(),
                    e.is_timeout()
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::build_request(&request);
        debug!(
            "Chat completion: model {}, {} messages",
            body.model,
            body.messages.len()
        );

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(response) => {
                    let response = Self::parse_response(response)?;
                    debug!(
                        "Chat completion done: {} tokens, finish_reason {:?}",
                        response.usage.total_tokens, response.finish_reason
                    );
                    return Ok(response);
                }
                Err(e) if Self::is_retryable(&e) && attempt < RETRY_DELAYS_MS.len() => {
                    let delay = Duration::from_millis(RETRY_DELAYS_MS[attempt]);
                    warn!("Chat completion attempt {} failed ({}), retrying in {:?}", attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Chat completion failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ChatResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        let role = serde_json::to_value(&message.role)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "user".to_string());
        Self {
            role,
            content: Some(message.content.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_requires_api_key() {
        let result = OpenAiProvider::new(OpenAiConfig::default());
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_config_from_section_trims_slash() {
        let section = ClassifierSection {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        let config = OpenAiConfig::from_section(&section, "key".to_string());
        assert_eq!(config.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_request_serialization() {
        let request = CompletionRequest::chat("gemma-3-12b-it", "system", "hi")
            .with_temperature(0.1)
            .with_max_tokens(500);
        let json = serde_json::to_value(OpenAiProvider::build_request(&request)).unwrap();

        assert_eq!(json["model"], "gemma-3-12b-it");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 500);
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn test_json_response_format() {
        let request = CompletionRequest::chat("m", "s", "u").with_response_format(ResponseFormat::Json);
        let json = serde_json::to_value(OpenAiProvider::build_request(&request)).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            OpenAiProvider::status_error(StatusCode::UNAUTHORIZED, ""),
            LlmError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            OpenAiProvider::status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::RateLimitExceeded(_)
        ));

        let server = OpenAiProvider::status_error(StatusCode::BAD_GATEWAY, "");
        assert!(OpenAiProvider::is_retryable(&server));

        let client = OpenAiProvider::status_error(StatusCode::BAD_REQUEST, "");
        assert!(!OpenAiProvider::is_retryable(&client));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(OpenAiProvider::finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(OpenAiProvider::finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(OpenAiProvider::finish_reason(None), FinishReason::Error);
    }

    #[test]
    fn test_empty_choices_is_invalid() {
        let response = ChatResponse {
            model: None,
            choices: vec![],
            usage: None,
        };
        assert!(matches!(
            OpenAiProvider::parse_response(response),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
