//! RabbitMQ transport via lapin

use super::{Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::debug;

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections on the current tokio runtime
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open(&self, config: &BrokerConfig) -> BusResult<Arc<dyn BrokerChannel>> {
        let uri = config
            .amqp_uri()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        debug!("Opening AMQP connection to {}", config.display_uri());
        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(map_lapin_error)?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "Bye").await;
                return Err(map_lapin_error(e));
            }
        };

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Map lapin failures onto bus error categories.
///
/// `PRECONDITION_FAILED` means a redeclaration conflicted with what the broker
/// already has; retrying will not help.
pub(crate) fn map_lapin_error(error: lapin::Error) -> BusError {
    match &error {
        lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BusError::configuration(amqp_error.to_string())
            }
            _ => BusError::channel(amqp_error.to_string()),
        },
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BusError::connection(error.to_string())
        }
        _ => BusError::channel(error.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BusResult<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BusResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        // The confirm is dropped: channels are not in confirm mode
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(map_lapin_error)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        let stream = consumer.map(|item| {
            item.map(|delivery| Delivery {
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
                delivery_tag: delivery.delivery_tag,
            })
            .map_err(map_lapin_error)
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn delete_queue(&self, queue: &str) -> BusResult<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn close(&self) -> BusResult<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "Bye").await {
                debug!("Channel close failed: {}", e);
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(map_lapin_error)?;
        }
        Ok(())
    }
}
