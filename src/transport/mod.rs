//! Transport layer for the MAIA topic bus
//!
//! The broker itself sits behind two small traits, [`Broker`] (open a
//! connection plus channel) and [`BrokerChannel`] (the AMQP operations the bus
//! needs). [`amqp::AmqpBroker`] talks to RabbitMQ via lapin and
//! [`memory::InMemoryBroker`] is an in-process topic exchange with the same
//! semantics, used in tests.
//!
//! On top of the seam sit the components every MAIA process uses:
//!
//! - [`BrokerConnection`]: one connection + channel, exchange declaration and reconnect policy
//! - [`Publisher`]: fire-and-forget JSON publishing
//! - [`SubscriptionRegistry`]: subscription bookkeeping keyed by id
//! - [`Consumer`]: durable per-subscription queues and the background consume loop

use crate::config::BrokerConfig;
use crate::error::BusResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod health_monitor;
pub mod memory;
pub mod publisher;
pub mod registry;

pub use amqp::AmqpBroker;
pub use connection::{BrokerConnection, ConnectionState};
pub use consumer::{Consumer, ConsumerOptions};
pub use health_monitor::{ConsumerEvent, ConsumerState, HealthMonitor};
pub use memory::InMemoryBroker;
pub use publisher::Publisher;
pub use registry::{Subscription, SubscriptionId, SubscriptionRegistry};

/// A raw message taken off a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

/// Deliveries for one consumer tag. Ends when the consumer is cancelled or
/// the channel closes; yields an error first if the connection was lost.
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Opens broker connections
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection and one channel on it
    async fn open(&self, config: &BrokerConfig) -> BusResult<Arc<dyn BrokerChannel>>;
}

/// The AMQP operations the bus relies on, scoped to one connection + channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// True while both the connection and the channel are usable
    fn is_open(&self) -> bool;

    /// Declare an exchange. Redeclaring with identical parameters is a no-op;
    /// conflicting parameters yield a configuration error.
    async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BusResult<()>;

    /// Declare a durable, non-auto-delete queue
    async fn declare_queue(&self, queue: &str) -> BusResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()>;

    /// Publish a persistent JSON message. Does not wait for a broker confirm.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BusResult<()>;

    /// Start an auto-ack consumer on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()>;

    async fn delete_queue(&self, queue: &str) -> BusResult<()>;

    /// Close channel and connection
    async fn close(&self) -> BusResult<()>;
}

/// What every subscriber callback receives
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Concrete routing key the message was published with
    pub topic: String,
    pub payload: Value,
    /// Already acknowledged on receipt; informational only
    pub delivery_tag: u64,
}

/// Subscriber callback
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// Adapter turning an async closure into an [`EnvelopeHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, envelope: Envelope) {
        (self.f)(envelope).await
    }
}

/// Wrap an async closure as a subscriber callback.
///
/// ```
/// use maia::transport::handler_fn;
///
/// let handler = handler_fn(|envelope| async move {
///     println!("{} -> {}", envelope.topic, envelope.payload);
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |envelope: Envelope| -> BoxFuture<'static, ()> { Box::pin(f(envelope)) },
    })
}
