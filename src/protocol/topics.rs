//! Topic grammar, wildcard matching and queue-name derivation for the MAIA bus
//!
//! Topics are dot-delimited routing keys. Subscription patterns use the
//! exchange-native wildcards: `*` matches exactly one segment and `#` matches
//! zero or more segments. `#` is only accepted as the last segment.

use thiserror::Error;
use uuid::Uuid;

/// Single-segment wildcard
pub const WILDCARD_ONE: &str = "*";
/// Multi-segment wildcard
pub const WILDCARD_MANY: &str = "#";

/// Fixed topic names shared by every MAIA component
pub struct TopicBuilder;

impl TopicBuilder {
    /// Pattern the log sink binds to
    pub const LOG_PATTERN: &'static str = "*.log.*";
    /// Pattern covering every agent request topic
    pub const AGENT_REQUEST_PATTERN: &'static str = "agent.*.request";

    /// Inbound chat text: `user.message.new`
    pub fn user_message_new() -> String {
        "user.message.new".to_string()
    }

    /// Outbound chat text: `user.message.processed`
    pub fn user_message_processed() -> String {
        "user.message.processed".to_string()
    }

    /// Per-agent inbound topic: `agent.{name}.request`
    pub fn agent_request(agent_name: &str) -> String {
        format!("agent.{agent_name}.request")
    }

    /// Log fan-out topic: `{sender}.log.{level}`
    pub fn log(sender: &str, level: &str) -> String {
        format!("{sender}.log.{level}")
    }
}

/// Validate a concrete routing key used for publishing.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    for segment in split_segments(topic)? {
        if segment == WILDCARD_ONE || segment == WILDCARD_MANY {
            return Err(TopicError::WildcardInRoutingKey(topic.to_string()));
        }
        validate_literal(segment)?;
    }
    Ok(())
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    let segments = split_segments(pattern)?;
    let last = segments.len() - 1;
    for (index, segment) in segments.into_iter().enumerate() {
        if segment == WILDCARD_MANY && index != last {
            return Err(TopicError::NonTerminalMultiWildcard(pattern.to_string()));
        }
        if segment == WILDCARD_ONE || segment == WILDCARD_MANY {
            continue;
        }
        if segment.contains('*') || segment.contains('#') {
            return Err(TopicError::PartialWildcard(segment.to_string()));
        }
        validate_literal(segment)?;
    }
    Ok(())
}

/// Validate a name that is interpolated into a topic as a single segment
/// (agent names, log senders).
pub fn validate_segment(name: &str) -> Result<(), TopicError> {
    if name.is_empty() {
        return Err(TopicError::EmptySegment(name.to_string()));
    }
    if name.contains('.') {
        return Err(TopicError::InvalidChar('.'));
    }
    if name.contains('*') || name.contains('#') {
        return Err(TopicError::PartialWildcard(name.to_string()));
    }
    validate_literal(name)
}

fn split_segments(topic: &str) -> Result<Vec<&str>, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    let segments: Vec<&str> = topic.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TopicError::EmptySegment(topic.to_string()));
    }
    Ok(segments)
}

fn validate_literal(segment: &str) -> Result<(), TopicError> {
    for ch in segment.chars() {
        if ch.is_whitespace() || ch.is_control() {
            return Err(TopicError::InvalidChar(ch));
        }
    }
    Ok(())
}

/// Exchange-native topic matching.
///
/// `*` consumes exactly one segment, `#` consumes zero or more. Matching is
/// done on whole segments, never on substrings.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&WILDCARD_MANY, [])) => true,
        Some((&WILDCARD_MANY, rest)) => {
            // `#` may swallow any prefix of the remaining key, including none of it
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&WILDCARD_ONE, rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((literal, rest)) => key
            .split_first()
            .is_some_and(|(head, tail)| head == literal && match_segments(rest, tail)),
    }
}

/// Derive the durable queue name for a subscription.
///
/// Layout: `maia.<pattern with '.'->'_', '*'->'star', '#'->'hash'>.<8 hex chars of id>`.
/// Deterministic in `(pattern, id)`.
pub fn derive_queue_name(pattern: &str, id: &Uuid) -> String {
    let escaped = pattern
        .replace('.', "_")
        .replace('*', "star")
        .replace('#', "hash");
    let simple = id.simple().to_string();
    format!("maia.{escaped}.{}", &simple[..8])
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains an empty segment: '{0}'")]
    EmptySegment(String),
    #[error("Routing key must not contain wildcards: '{0}'")]
    WildcardInRoutingKey(String),
    #[error("Wildcards must occupy a whole segment: '{0}'")]
    PartialWildcard(String),
    #[error("'#' is only allowed as the last segment: '{0}'")]
    NonTerminalMultiWildcard(String),
    #[error("Topic contains invalid character: {0:?}")]
    InvalidChar(char),
}
