//! Wire payloads carried on the MAIA bus
//!
//! Every payload is UTF-8 JSON. Chat text travels as [`ChatMessage`], the
//! classifier verdict as [`RoutingDecision`], agent input as [`AgentRequest`]
//! and bus log entries as [`LogRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::topics::validate_segment;

/// Text substituted when an inbound chat payload carries no `text` field
pub const MISSING_TEXT: &str = "no message found";

/// Chat text exchanged with the front-end on `user.message.*`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "lenient_chat_id")]
    pub chat_id: Option<i64>,
    #[serde(default = "missing_text")]
    pub text: String,
}

fn missing_text() -> String {
    MISSING_TEXT.to_string()
}

impl ChatMessage {
    pub fn new(chat_id: Option<i64>, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }

    /// Extract chat fields from a decoded payload.
    ///
    /// A `null` text is treated the same as a missing one.
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        let mut message: ChatMessage = serde_json::from_value(payload.clone())?;
        if payload.get("text").is_some_and(Value::is_null) {
            message.text = missing_text();
        }
        Ok(message)
    }
}

/// Structured verdict produced by the intent classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    #[serde(default, deserialize_with = "null_as_default")]
    pub original_request: String,
    #[serde(
        rename = "detected_primary_intent",
        alias = "primary_intent",
        default,
        deserialize_with = "null_as_default"
    )]
    pub primary_intent: String,
    #[serde(
        rename = "detected_entities",
        alias = "entities",
        default,
        deserialize_with = "entities_as_strings"
    )]
    pub entities: BTreeMap<String, String>,
    #[serde(default)]
    pub selected_agent: Option<String>,
    #[serde(
        rename = "confidence_score",
        alias = "confidence",
        default,
        deserialize_with = "null_as_default"
    )]
    pub confidence: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub secondary_agents: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub requires_clarification: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub context_to_forward: String,
}

impl RoutingDecision {
    /// Decode and validate classifier output.
    pub fn parse(raw: &str) -> Result<Self, DecisionError> {
        Self::parse_with_fields(raw).map(|(decision, _)| decision)
    }

    /// Like [`RoutingDecision::parse`], also returning the JSON object exactly
    /// as the classifier produced it, including fields this type ignores.
    pub fn parse_with_fields(raw: &str) -> Result<(Self, Map<String, Value>), DecisionError> {
        let fields: Map<String, Value> =
            serde_json::from_str(raw.trim()).map_err(DecisionError::Malformed)?;
        let decision: RoutingDecision = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(DecisionError::Malformed)?;
        decision.validate()?;
        Ok((decision, fields))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), DecisionError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DecisionError::ConfidenceOutOfRange(self.confidence));
        }
        if let Some(agent) = self.selected() {
            validate_segment(agent).map_err(|_| DecisionError::InvalidAgent(agent.to_string()))?;
        }
        Ok(())
    }

    /// The selected agent, treating an empty or blank name as absent
    pub fn selected(&self) -> Option<&str> {
        self.selected_agent
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Clarification question to send back to the user, if one is required
    pub fn clarification(&self) -> Option<&str> {
        if !self.requires_clarification {
            return None;
        }
        self.clarification_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

/// Payload published to `agent.<name>.request`
///
/// On the wire this is the classifier's decision object, untouched, with
/// `chat_id` added. Agents decode it into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(default, deserialize_with = "lenient_chat_id")]
    pub chat_id: Option<i64>,
    #[serde(flatten)]
    pub decision: RoutingDecision,
}

impl AgentRequest {
    /// Wire body for an agent: `decision_fields` as decoded, plus `chat_id`
    pub fn wire_payload(chat_id: Option<i64>, mut decision_fields: Map<String, Value>) -> Value {
        decision_fields.insert("chat_id".to_string(), chat_id.into());
        Value::Object(decision_fields)
    }

    /// Text an agent should work on: forwarded context, else the raw request
    pub fn prompt_text(&self) -> &str {
        let context = self.decision.context_to_forward.trim();
        if context.is_empty() {
            &self.decision.original_request
        } else {
            context
        }
    }
}

/// Severity carried in the last segment of a log topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Parse a topic segment. Case-sensitive, as topics are.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "critical" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log entry published by a bus logger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sender: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Classifier output that cannot be used for routing
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Classifier output is not a valid routing decision: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("Selected agent '{0}' is not a valid topic segment")]
    InvalidAgent(String),
}

/// Chat id carried by a payload value: an integer or a numeric string
pub fn chat_id_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Front-ends disagree on whether chat ids are numbers or strings
fn lenient_chat_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => chat_id_from_value(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid chat_id: {value}"))),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Classifiers occasionally emit numbers or lists as entity values
fn entities_as_strings<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect())
}
