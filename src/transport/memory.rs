//! In-process topic exchange
//!
//! Mirrors the broker semantics the bus depends on: durable queues that
//! buffer while no consumer is attached, topic bindings, consumer
//! cancellation and channel-closing errors. Tests can also take the broker
//! down and drop every live connection.

use super::{Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult};
use crate::protocol::topic_matches;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
struct ExchangeSpec {
    kind: String,
    durable: bool,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    tx: mpsc::UnboundedSender<BusResult<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<(String, Vec<u8>)>,
    consumer: Option<ConsumerSlot>,
}

#[derive(Default)]
struct State {
    unavailable: bool,
    open_attempts: usize,
    next_connection_id: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    published: Vec<(String, Vec<u8>)>,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) {
        let targets: BTreeSet<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue_name in targets {
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let Some(queue) = self.queues.get_mut(&queue_name) else {
                continue;
            };

            let delivered = match queue.consumer.as_ref() {
                Some(slot) => slot
                    .tx
                    .send(Ok(Delivery {
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                        delivery_tag: tag,
                    }))
                    .is_ok(),
                None => false,
            };

            if !delivered {
                queue.consumer = None;
                queue
                    .buffer
                    .push_back((routing_key.to_string(), body.to_vec()));
            }
        }
    }

    /// Detach every consumer owned by `connection_id`. With `error`, each
    /// stream yields it before ending.
    fn detach_consumers(&mut self, connection_id: u64, error: Option<&str>) {
        for queue in self.queues.values_mut() {
            let owned = queue
                .consumer
                .as_ref()
                .is_some_and(|slot| slot.connection_id == connection_id);
            if owned {
                if let (Some(slot), Some(reason)) = (queue.consumer.take(), error) {
                    let _ = slot.tx.send(Err(BusError::connection(reason)));
                }
            }
        }
    }
}

/// Topic exchange living in the current process. Cloning shares the broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// While unavailable, `open` fails with a connection error
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Kill every open connection, as a broker restart would. Durable queues,
    /// bindings and buffered messages survive.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.detach_consumers(id, Some("connection reset by broker"));
            if let Some(open) = state.connections.remove(&id) {
                open.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Every message published so far, as `(routing key, JSON payload)`
    pub fn published(&self) -> Vec<(String, Value)> {
        self.lock()
            .published
            .iter()
            .map(|(key, body)| {
                let payload = serde_json::from_slice(body)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
                (key.clone(), payload)
            })
            .collect()
    }

    /// Payloads published with exactly this routing key
    pub fn published_to(&self, routing_key: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages buffered in `queue` waiting for a consumer
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.buffer.len())
            .unwrap_or(0)
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of times `open` was called, successful or not
    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open(&self, _config: &BrokerConfig) -> BusResult<Arc<dyn BrokerChannel>> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.unavailable {
            return Err(BusError::connection("connection refused"));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(id, open.clone());

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
            open,
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<State>>,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Lock the broker, failing if this channel has been closed
    fn guard(&self) -> BusResult<MutexGuard<'_, State>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::connection("channel closed"));
        }
        Ok(lock_state(&self.state))
    }

    /// A channel-level exception closes the channel, as AMQP does
    fn fail(&self, state: &mut State, error: BusError) -> BusError {
        state.detach_consumers(self.id, None);
        state.connections.remove(&self.id);
        self.open.store(false, Ordering::SeqCst);
        error
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BusResult<()> {
        let mut state = self.guard()?;
        let spec = ExchangeSpec {
            kind: kind.to_string(),
            durable,
        };

        match state.exchanges.get(name) {
            Some(existing) if *existing != spec => {
                let error = BusError::configuration(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    name, kind, existing.kind
                ));
                Err(self.fail(&mut state, error))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), spec);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        let mut state = self.guard()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()> {
        let mut state = self.guard()?;
        if !state.exchanges.contains_key(exchange) {
            let error = BusError::channel(format!("NOT_FOUND - no exchange '{}'", exchange));
            return Err(self.fail(&mut state, error));
        }
        if !state.queues.contains_key(queue) {
            let error = BusError::channel(format!("NOT_FOUND - no queue '{}'", queue));
            return Err(self.fail(&mut state, error));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BusResult<()> {
        let mut state = self.guard()?;
        if !state.exchanges.contains_key(exchange) {
            let error = BusError::channel(format!("NOT_FOUND - no exchange '{}'", exchange));
            return Err(self.fail(&mut state, error));
        }

        state.route(exchange, routing_key, &body);
        state.published.push((routing_key.to_string(), body));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        let mut state = self.guard()?;

        let busy_with = match state.queues.get(queue) {
            None => {
                let error = BusError::channel(format!("NOT_FOUND - no queue '{}'", queue));
                return Err(self.fail(&mut state, error));
            }
            Some(q) => q
                .consumer
                .as_ref()
                .filter(|slot| !slot.tx.is_closed())
                .map(|slot| slot.tag.clone()),
        };
        if let Some(existing) = busy_with {
            let error = BusError::channel(format!(
                "ACCESS_REFUSED - queue '{}' already has consumer '{}'",
                queue, existing
            ));
            return Err(self.fail(&mut state, error));
        }

        let backlog: Vec<(String, Vec<u8>)> = state
            .queues
            .get_mut(queue)
            .map(|q| q.buffer.drain(..).collect())
            .unwrap_or_default();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (routing_key, body) in backlog {
            state.next_delivery_tag += 1;
            let _ = tx.send(Ok(Delivery {
                routing_key,
                body,
                delivery_tag: state.next_delivery_tag,
            }));
        }

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BusError::channel(format!("NOT_FOUND - no queue '{}'", queue)));
        };
        queue_state.consumer = Some(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection_id: self.id,
            tx,
        });

        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        let mut state = self.guard()?;
        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|slot| slot.tag == consumer_tag && slot.connection_id == self.id)
            {
                queue.consumer = None;
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> BusResult<()> {
        let mut state = self.guard()?;
        state.queues.remove(queue);
        state.bindings.retain(|b| b.queue != queue);
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock_state(&self.state);
        state.detach_consumers(self.id, None);
        state.connections.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let channel = broker.open(&BrokerConfig::default()).await.unwrap();
        channel.declare_exchange("maia", "topic", true).await.unwrap();
        channel
    }

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let result = broker.open(&BrokerConfig::default()).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(broker.open_attempts(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_exchange_closes_channel() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;

        let result = channel.declare_exchange("maia", "direct", true).await;
        assert!(matches!(result, Err(BusError::Configuration(_))));
        assert!(!channel.is_open());

        let again = open(&broker).await;
        assert!(again.declare_exchange("maia", "topic", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_unbound_publish_is_dropped() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;

        channel
            .publish("maia", "user.message.new", body(json!({"text": "hi"})))
            .await
            .unwrap();

        assert_eq!(broker.published_to("user.message.new").len(), 1);
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_durable_queue_buffers_until_consumed() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_queue("q").await.unwrap();
        channel.bind_queue("q", "maia", "agent.*.request").await.unwrap();

        channel
            .publish("maia", "agent.WeatherAgent.request", body(json!({"n": 1})))
            .await
            .unwrap();
        channel
            .publish("maia", "agent.X.Y.request", body(json!({"n": 2})))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 1);

        let mut stream = channel.consume("q", "q").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, "agent.WeatherAgent.request");
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_overlapping_bindings_deliver_once_per_queue() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_queue("q").await.unwrap();
        channel.bind_queue("q", "maia", "#").await.unwrap();
        channel.bind_queue("q", "maia", "a.*").await.unwrap();

        channel.publish("maia", "a.b", body(json!(1))).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_errors_streams_and_keeps_queues() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_queue("q").await.unwrap();
        channel.bind_queue("q", "maia", "a.#").await.unwrap();
        let mut stream = channel.consume("q", "q").await.unwrap();

        broker.drop_connections();

        assert!(matches!(
            stream.next().await,
            Some(Err(BusError::Connection(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
        assert!(broker.has_queue("q"));
        assert_eq!(broker.open_connections(), 0);

        let publisher = open(&broker).await;
        publisher.publish("maia", "a.b", body(json!(1))).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_cancel_and_delete_end_stream() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.declare_queue("q").await.unwrap();
        channel.bind_queue("q", "maia", "#").await.unwrap();
        let mut stream = channel.consume("q", "q").await.unwrap();

        channel.cancel("q").await.unwrap();
        channel.delete_queue("q").await.unwrap();
        channel.delete_queue("q").await.unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(broker.binding_count(), 0);
        assert!(!broker.has_queue("q"));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_operations() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.close().await.unwrap();

        let result = channel.publish("maia", "a.b", body(json!(1))).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert!(channel.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_consume_missing_queue_fails() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;

        let result = channel.consume("nope", "nope").await;
        assert!(matches!(result, Err(BusError::Channel(_))));
    }
}
