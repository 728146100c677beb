//! Fire-and-forget JSON publishing

use super::connection::BrokerConnection;
use super::Broker;
use crate::config::BrokerConfig;
use crate::error::BusResult;
use crate::protocol::validate_topic;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Publishes persistent JSON messages to the topic exchange.
///
/// Owns its own connection, separate from any consumer.
pub struct Publisher {
    connection: BrokerConnection,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self {
            connection: BrokerConnection::new("publisher", broker, config),
        }
    }

    /// Open the connection eagerly. Publishing also connects on demand.
    pub async fn connect(&self) -> BusResult<()> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Publish `payload` to `topic`.
    ///
    /// Reconnects first if the connection dropped. Returns `false` on any
    /// failure; the error has already been logged. The broker's routing
    /// outcome is not observed.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> bool {
        match self.try_publish(topic, payload).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to publish to '{}': {}", topic, e);
                false
            }
        }
    }

    /// Like [`Publisher::publish`], surfacing the error instead of logging it
    pub async fn try_publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> BusResult<()> {
        validate_topic(topic)?;
        let body = serde_json::to_vec(payload)?;
        let channel = self.connection.channel().await?;

        channel
            .publish(self.connection.exchange(), topic, body)
            .await?;
        debug!("Published to '{}'", topic);
        Ok(())
    }
}
