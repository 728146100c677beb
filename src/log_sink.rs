//! Collects bus log records from every component
//!
//! The sink binds `*.log.*` and re-emits each record as a local `tracing`
//! event, so the process-wide subscriber (and its rolling file layer, when
//! `LOG_DIR` is set) is where bus logs end up.

use crate::error::BusResult;
use crate::lifecycle::Component;
use crate::protocol::{LogLevel, TopicBuilder};
use crate::transport::{Consumer, Envelope, EnvelopeHandler, SubscriptionId};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Sender and level taken from a log routing key
#[derive(Debug, Clone, PartialEq)]
pub struct LogRoute {
    pub sender: String,
    /// `None` for a level segment that is not a known level
    pub level: Option<LogLevel>,
    pub raw_level: String,
}

/// Split `<sender>.log.<level>`: sender is the first segment, level the last
pub fn parse_log_route(routing_key: &str) -> LogRoute {
    let mut segments = routing_key.split('.');
    let sender = segments.next().unwrap_or_default().to_string();
    let raw_level = routing_key.rsplit('.').next().unwrap_or_default().to_string();
    LogRoute {
        level: LogLevel::from_segment(&raw_level),
        sender,
        raw_level,
    }
}

/// Text of a log payload: a bare string, the `message` field of an object,
/// or the JSON itself
pub fn render_message(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Object(fields) => match fields.get("message") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => payload.to_string(),
        },
        other => other.to_string(),
    }
}

/// Emit one bus log record as a local tracing event
pub fn emit(route: &LogRoute, message: &str) {
    let sender = route.sender.as_str();
    match route.level {
        Some(LogLevel::Debug) => debug!(sender, "{}", message),
        Some(LogLevel::Info) => info!(sender, "{}", message),
        Some(LogLevel::Warning) => warn!(sender, "{}", message),
        Some(LogLevel::Error) => error!(sender, "{}", message),
        Some(LogLevel::Critical) => error!(sender, critical = true, "{}", message),
        None => info!(
            sender,
            level = %route.raw_level,
            "(UNKNOWN LEVEL) {}",
            message
        ),
    }
}

struct SinkHandler;

#[async_trait]
impl EnvelopeHandler for SinkHandler {
    async fn handle(&self, envelope: Envelope) {
        let route = parse_log_route(&envelope.topic);
        emit(&route, &render_message(&envelope.payload));
    }
}

pub struct LogSink {
    consumer: Arc<Consumer>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl LogSink {
    pub fn new(consumer: Arc<Consumer>) -> Self {
        Self {
            consumer,
            subscription: Mutex::new(None),
        }
    }

    /// Bind `*.log.*`. Idempotent.
    pub async fn start(&self) -> BusResult<SubscriptionId> {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = *subscription {
            return Ok(id);
        }
        let id = self
            .consumer
            .subscribe(TopicBuilder::LOG_PATTERN, Arc::new(SinkHandler))
            .await?;
        *subscription = Some(id);
        info!("Log sink listening on {}", TopicBuilder::LOG_PATTERN);
        Ok(id)
    }

    pub async fn stop(&self) {
        self.subscription.lock().await.take();
        self.consumer.close().await;
        info!("Log sink stopped");
    }
}

#[async_trait]
impl Component for LogSink {
    fn name(&self) -> &str {
        "logsink"
    }

    async fn launch(&self) -> BusResult<()> {
        self.start().await.map(|_| ())
    }

    async fn release(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_levels() {
        let route = parse_log_route("dispatcher.log.info");
        assert_eq!(route.sender, "dispatcher");
        assert_eq!(route.level, Some(LogLevel::Info));

        let route = parse_log_route("CalendarAgent.log.critical");
        assert_eq!(route.sender, "CalendarAgent");
        assert_eq!(route.level, Some(LogLevel::Critical));
    }

    #[test]
    fn test_parse_unknown_level() {
        let route = parse_log_route("bot.log.verbose");
        assert_eq!(route.level, None);
        assert_eq!(route.raw_level, "verbose");
    }

    #[test]
    fn test_render_message_shapes() {
        assert_eq!(render_message(&json!("plain text")), "plain text");
        assert_eq!(
            render_message(&json!({"sender": "x", "message": "from record"})),
            "from record"
        );
        assert_eq!(render_message(&json!({"message": 42})), "42");
        assert_eq!(render_message(&json!({"other": 1})), r#"{"other":1}"#);
        assert_eq!(render_message(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_emit_accepts_every_level() {
        for key in [
            "a.log.debug",
            "a.log.info",
            "a.log.warning",
            "a.log.error",
            "a.log.critical",
            "a.log.bogus",
        ] {
            emit(&parse_log_route(key), "message");
        }
    }
}
