//! Tests against a real RabbitMQ broker
//!
//! Ignored by default. Run with a broker on localhost (or at
//! `MAIA_TEST_AMQP_HOST`) using the guest account:
//!
//! ```bash
//! docker run -d -p 5672:5672 rabbitmq:3
//! cargo test --test test_live_rabbitmq -- --ignored
//! ```


use maia::config::BrokerConfig;
use maia::error::BusError;
use maia::testing::RecordingHandler;
use maia::transport::{AmqpBroker, BrokerConnection, Consumer, ConsumerState, Publisher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::fast_options;
use uuid::Uuid;

const LIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker config for the live broker, on an exchange private to this test
fn live_config() -> BrokerConfig {
    BrokerConfig {
        host: std::env::var("MAIA_TEST_AMQP_HOST").unwrap_or_else(|_| "localhost".to_string()),
        exchange: format!("maia-test-{}", Uuid::new_v4().simple()),
        retry_delay_secs: 1,
        ..Default::default()
    }
}

fn live_consumer(config: &BrokerConfig) -> Consumer {
    Consumer::with_options(Arc::new(AmqpBroker::new()), config.clone(), fast_options())
}

fn live_publisher(config: &BrokerConfig) -> Publisher {
    Publisher::new(Arc::new(AmqpBroker::new()), config.clone())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn test_connect_declares_exchange() {
    let config = live_config();
    let connection = BrokerConnection::new("live", Arc::new(AmqpBroker::new()), config);

    connection.connect().await.unwrap();
    assert!(connection.is_open().await);

    // Reconnecting to an existing exchange with the same settings is fine
    connection.connect().await.unwrap();
    connection.disconnect().await;
    assert!(!connection.is_open().await);
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn test_publish_and_consume_with_wildcards() {
    let config = live_config();
    let consumer = live_consumer(&config);
    let publisher = live_publisher(&config);
    let agents = RecordingHandler::new();
    let logs = RecordingHandler::new();

    consumer.subscribe("agent.*.request", agents.clone()).await.unwrap();
    consumer.subscribe("*.log.#", logs.clone()).await.unwrap();

    assert!(publisher.publish("agent.WeatherAgent.request", &json!({"chat_id": 1})).await);
    assert!(publisher.publish("dispatcher.log.info", &json!("started")).await);
    assert!(publisher.publish("agent.WeatherAgent.extra.request", &json!(0)).await);

    assert!(agents.wait_for(1, LIVE_TIMEOUT).await);
    assert!(logs.wait_for(1, LIVE_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(agents.topics(), vec!["agent.WeatherAgent.request"]);
    assert_eq!(agents.received()[0].payload, json!({"chat_id": 1}));
    assert_eq!(logs.topics(), vec!["dispatcher.log.info"]);

    publisher.disconnect().await;
    consumer.close().await;
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn test_unsubscribe_stops_delivery() {
    let config = live_config();
    let consumer = live_consumer(&config);
    let publisher = live_publisher(&config);
    let handler = RecordingHandler::new();

    let id = consumer.subscribe("user.message.new", handler.clone()).await.unwrap();
    publisher.publish("user.message.new", &json!({"text": "one"})).await;
    assert!(handler.wait_for(1, LIVE_TIMEOUT).await);

    assert!(consumer.unsubscribe(id).await);
    publisher.publish("user.message.new", &json!({"text": "two"})).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.count(), 1);

    publisher.disconnect().await;
    consumer.close().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn test_conflicting_exchange_type_is_fatal() {
    let config = live_config();
    let topic = BrokerConnection::new("topic", Arc::new(AmqpBroker::new()), config.clone());
    topic.connect().await.unwrap();

    // Same exchange name, declared as a different kind by another client
    let result = declare_as_fanout(&config).await;
    assert!(matches!(result, Err(BusError::Configuration(_))));

    let again = BrokerConnection::new("again", Arc::new(AmqpBroker::new()), config);
    assert!(again.connect().await.is_ok());
    topic.disconnect().await;
    again.disconnect().await;
}

async fn declare_as_fanout(config: &BrokerConfig) -> Result<(), BusError> {
    let connection = BrokerConnection::new(
        "fanout",
        Arc::new(AmqpBroker::new()),
        BrokerConfig {
            exchange_type: "fanout".to_string(),
            connection_attempts: 1,
            ..config.clone()
        },
    );
    connection.connect().await
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn test_unreachable_broker_exhausts_attempts() {
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        connection_attempts: 2,
        retry_delay_secs: 0,
        ..Default::default()
    };
    let connection = BrokerConnection::new("nowhere", Arc::new(AmqpBroker::new()), config);

    let result = connection.connect().await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert!(!connection.is_open().await);
}
