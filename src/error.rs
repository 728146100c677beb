//! Error types for the MAIA bus and dispatcher
//!
//! Broker I/O errors are [`BusError`]s and never escape the public bus
//! operations uncaught. Message handling errors are [`DispatchError`]s and are
//! reported to the bus log by whichever handler caught them.

use crate::llm::provider::LlmError;
use crate::protocol::{DecisionError, TopicError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors raised by the broker connection, publisher and consumer
#[derive(Debug, Error)]
pub enum BusError {
    /// Transport unreachable or authentication refused
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol-level failure on an open channel
    #[error("Channel error: {0}")]
    Channel(String),

    /// Payload could not be decoded as JSON
    #[error("Decode error: {0}")]
    Decode(String),

    /// Exchange redeclared with conflicting parameters, or unusable config
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    /// The client was explicitly disconnected
    #[error("Bus client is stopping")]
    Stopped,

    #[error("Not connected to broker")]
    NotConnected,
}

impl BusError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel(message.into())
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Errors that warrant the long reconnect backoff
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }

    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Stopped)
    }
}

/// Errors raised while turning a user message into a routed request
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Classifier output could not be decoded into a routing decision
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("LLM provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Publish to '{0}' failed")]
    PublishFailed(String),
}

impl DispatchError {
    pub fn classification<S: Into<String>>(message: S) -> Self {
        Self::Classification(message.into())
    }

    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload(message.into())
    }
}

impl From<DecisionError> for DispatchError {
    fn from(error: DecisionError) -> Self {
        Self::Classification(error.to_string())
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static URI_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(amqps?://[^:/@\s]+):[^@\s]+@").ok());

const MAX_PUBLISHED_ERROR_LEN: usize = 500;

/// Redact credentials and cap length before an error text is published to the bus.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = URI_CREDENTIALS.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}:***@").to_string();
    }

    if sanitized.len() > MAX_PUBLISHED_ERROR_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_PUBLISHED_ERROR_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
