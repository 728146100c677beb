//! MAIA - messaging core of a multi-agent assistant
//!
//! MAIA components talk to each other only through a topic exchange on an
//! AMQP broker. This crate provides the bus client every component uses and
//! the dispatcher that routes user messages to agents.
//!
//! # Overview
//!
//! - [`protocol`]: topic grammar, wildcard matching and wire payloads
//! - [`transport`]: broker connection, publisher, subscription registry and
//!   the reconnecting consumer, over RabbitMQ or an in-process exchange
//! - [`dispatch`]: intent classification and routing of `user.message.new`
//! - [`bus_logger`] / [`log_sink`]: logging over `<sender>.log.<level>`
//! - [`agent`]: workers serving `agent.<name>.request`
//! - [`lifecycle`]: launch/release pairing and signal-driven shutdown
//!
//! # Quick Start
//!
//! ```rust
//! use maia::config::BrokerConfig;
//! use maia::transport::{handler_fn, Consumer, InMemoryBroker, Publisher};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = Arc::new(InMemoryBroker::new());
//! let consumer = Consumer::new(broker.clone(), BrokerConfig::default());
//! let publisher = Publisher::new(broker.clone(), BrokerConfig::default());
//!
//! let id = consumer
//!     .subscribe("agent.*.request", handler_fn(|envelope| async move {
//!         println!("{} -> {}", envelope.topic, envelope.payload);
//!     }))
//!     .await
//!     .unwrap();
//!
//! assert!(publisher.publish("agent.WeatherAgent.request", &json!({"chat_id": 1})).await);
//!
//! assert!(consumer.unsubscribe(id).await);
//! consumer.close().await;
//! # });
//! ```

pub mod agent;
pub mod bus_logger;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod log_sink;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod transport;

pub use bus_logger::BusLogger;
pub use config::{BrokerConfig, ConfigError, MaiaConfig};
pub use dispatch::Dispatcher;
pub use error::{BusError, BusResult, DispatchError, DispatchResult};
pub use protocol::*;
pub use transport::{Consumer, Envelope, EnvelopeHandler, Publisher, SubscriptionId};
