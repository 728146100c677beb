//! Logging over the bus
//!
//! A [`BusLogger`] is constructed once per component and passed in; records
//! go to `<sender>.log.<level>` where the log sink picks them up. It is
//! separate from process-local `tracing` output, which every component also
//! emits.

use crate::error::sanitize_error_message;
use crate::protocol::{LogLevel, LogRecord, TopicBuilder};
use crate::transport::Publisher;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct BusLogger {
    sender: String,
    publisher: Arc<Publisher>,
}

impl BusLogger {
    /// `sender` becomes the first topic segment, so it must not contain dots
    pub fn new(sender: impl Into<String>, publisher: Arc<Publisher>) -> Self {
        Self {
            sender: sender.into(),
            publisher,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Publish one record. Returns whether the publish went out.
    pub async fn log(&self, level: LogLevel, message: impl AsRef<str>) -> bool {
        let record = LogRecord {
            sender: self.sender.clone(),
            level,
            message: sanitize_error_message(message.as_ref()),
            timestamp: Utc::now(),
        };
        let topic = TopicBuilder::log(&self.sender, level.as_str());

        let published = self.publisher.publish(&topic, &record).await;
        if !published {
            warn!(
                sender = %self.sender,
                level = %level,
                "Bus log record dropped: {}",
                record.message
            );
        }
        published
    }

    pub async fn debug(&self, message: impl AsRef<str>) -> bool {
        self.log(LogLevel::Debug, message).await
    }

    pub async fn info(&self, message: impl AsRef<str>) -> bool {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warning(&self, message: impl AsRef<str>) -> bool {
        self.log(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl AsRef<str>) -> bool {
        self.log(LogLevel::Error, message).await
    }

    pub async fn critical(&self, message: impl AsRef<str>) -> bool {
        self.log(LogLevel::Critical, message).await
    }
}
