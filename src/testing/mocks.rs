//! Mock collaborators for tests
//!
//! Everything here records what it was asked to do so tests can assert on it
//! without a network: an LLM provider, a classifier and a subscriber callback
//! that collects envelopes.

use crate::dispatch::Classifier;
use crate::error::{DispatchError, DispatchResult};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::transport::{Envelope, EnvelopeHandler};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// LLM provider that replays canned responses in order, cycling at the end
#[derive(Debug, Default)]
pub struct MockLlmProvider {
    responses: Vec<String>,
    failure: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            ..Default::default()
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Every call fails with a request error carrying `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = {
            let mut requests = lock(&self.requests);
            requests.push(request);
            requests.len() - 1
        };

        if let Some(message) = &self.failure {
            return Err(LlmError::RequestFailed(message.clone()));
        }

        let content = if self.responses.is_empty() {
            "Mock response".to_string()
        } else {
            self.responses[call % self.responses.len()].clone()
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
        })
    }
}

enum Scripted {
    Reply(String),
    Fail(String),
}

/// Classifier returning scripted replies, one per call
///
/// When the script runs out the last reply is repeated.
#[derive(Default)]
pub struct MockClassifier {
    script: Mutex<VecDeque<Scripted>>,
    last: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always reply with `raw`
    pub fn replying(raw: impl Into<String>) -> Self {
        let classifier = Self::new();
        classifier.push_reply(raw);
        classifier
    }

    /// Always reply with `decision` serialized to JSON
    pub fn replying_json(decision: &serde_json::Value) -> Self {
        Self::replying(decision.to_string())
    }

    pub fn push_reply(&self, raw: impl Into<String>) {
        lock(&self.script).push_back(Scripted::Reply(raw.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        lock(&self.script).push_back(Scripted::Fail(message.into()));
    }

    /// `(system_prompt, text)` of every call so far
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, system_prompt: &str, text: &str) -> DispatchResult<String> {
        lock(&self.calls).push((system_prompt.to_string(), text.to_string()));

        let next = lock(&self.script).pop_front();
        match next {
            Some(Scripted::Reply(raw)) => {
                *lock(&self.last) = Some(raw.clone());
                Ok(raw)
            }
            Some(Scripted::Fail(message)) => Err(DispatchError::classification(message)),
            None => lock(&self.last)
                .clone()
                .ok_or_else(|| DispatchError::classification("mock classifier has no reply")),
        }
    }
}

/// Subscriber callback that stores every envelope it receives
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<Envelope>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Envelope> {
        lock(&self.received).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.received)
            .iter()
            .map(|e| e.topic.clone())
            .collect()
    }

    /// Wait until at least `count` envelopes arrived. Returns `false` on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl EnvelopeHandler for RecordingHandler {
    async fn handle(&self, envelope: Envelope) {
        lock(&self.received).push(envelope);
        self.notify.notify_waiters();
    }
}
