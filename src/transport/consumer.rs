//! Durable per-subscription queues and the background consume loop
//!
//! Every `subscribe` call gets its own durable queue, bound to the shared
//! topic exchange with the subscription's pattern. A forwarder task per queue
//! pushes deliveries into one channel that a single worker drains, so
//! callbacks for one consumer never run concurrently. The worker also owns
//! recovery: when a queue's stream ends or the connection drops it reconnects
//! and rebinds every subscription before delivering again.
//!
//! Deliveries are auto-acknowledged, so a callback that panics loses that
//! message.

use super::connection::{interruptible_sleep, BrokerConnection};
use super::health_monitor::{ConsumerEvent, ConsumerState, HealthMonitor, LoopDecision};
use super::registry::{BindTarget, Subscription, SubscriptionId, SubscriptionRegistry};
use super::{Broker, BrokerChannel, Delivery, DeliveryStream, Envelope, EnvelopeHandler};
use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult};
use crate::protocol::{derive_queue_name, validate_pattern};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Timings for the consume loop
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Wait after a connection failure before trying again
    pub connection_backoff: Duration,
    /// Wait after any other loop failure, including a panicking callback
    pub error_backoff: Duration,
    /// How long `disconnect` waits for the worker before aborting it
    pub join_timeout: Duration,
    /// How often an idle worker checks that the connection is still open
    pub health_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            connection_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(1),
        }
    }
}

enum Inbound {
    Delivery {
        subscription: SubscriptionId,
        delivery: Delivery,
    },
    StreamEnded {
        subscription: SubscriptionId,
        generation: u64,
        error: Option<BusError>,
    },
}

struct Shared {
    connection: BrokerConnection,
    registry: SubscriptionRegistry,
    options: ConsumerOptions,
    // Serializes queue management against the worker's rebinds
    bind_lock: tokio::sync::Mutex<()>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<ConsumerState>,
}

/// Subscribes callbacks to topic patterns and runs the consume loop
pub struct Consumer {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self::with_options(broker, config, ConsumerOptions::default())
    }

    pub fn with_options(
        broker: Arc<dyn Broker>,
        config: BrokerConfig,
        options: ConsumerOptions,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConsumerState::Idle);
        Self {
            shared: Arc::new(Shared {
                connection: BrokerConnection::new("consumer", broker, config),
                registry: SubscriptionRegistry::new(),
                options,
                bind_lock: tokio::sync::Mutex::new(()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                worker: Mutex::new(None),
                state_tx,
            }),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.shared.connection
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.shared.registry
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.state_tx.subscribe()
    }

    /// Bind a fresh durable queue to `pattern` and deliver matching messages
    /// to `handler`.
    ///
    /// Messages published before this returns are not seen. Subscribing to
    /// the same pattern twice yields two independent queues.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> BusResult<SubscriptionId> {
        validate_pattern(pattern)?;
        if !HealthMonitor::accepts_subscriptions(self.state()) {
            return Err(BusError::Stopped);
        }

        let shared = &self.shared;
        let _guard = shared.bind_lock.lock().await;
        let channel = shared.connection.channel().await?;
        let generation = shared.connection.generation();

        let mut id = Uuid::new_v4();
        let mut queue_name = derive_queue_name(pattern, &id);
        while shared.registry.contains_queue(&queue_name) {
            id = Uuid::new_v4();
            queue_name = derive_queue_name(pattern, &id);
        }

        shared
            .registry
            .insert(Subscription::new(id, pattern, queue_name.clone(), handler));
        let target = BindTarget {
            id,
            pattern: pattern.to_string(),
            queue_name,
        };

        if let Err(e) = shared.bind(channel.as_ref(), &target, generation).await {
            shared.registry.remove(&id);
            if channel.is_open() {
                if let Err(cleanup) = channel.delete_queue(&target.queue_name).await {
                    debug!("Cleanup of queue {} failed: {}", target.queue_name, cleanup);
                }
            }
            error!("Subscribe to '{}' failed: {}", pattern, e);
            return Err(e);
        }

        info!("Subscribed to '{}' (queue {})", pattern, target.queue_name);
        self.ensure_worker();
        Ok(id)
    }

    /// Cancel the consumer, delete the queue and forget the subscription.
    ///
    /// Returns `false` for an unknown id or when the broker refuses; in the
    /// latter case the subscription stays registered and is rebound on the
    /// next reconnect, so the call can be retried.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let shared = &self.shared;
        let Some(target) = shared.registry.target(&id) else {
            debug!("Unsubscribe for unknown subscription {}", id);
            return false;
        };

        let _guard = shared.bind_lock.lock().await;
        shared.registry.detach(&id);
        let result: BusResult<()> = async {
            let channel = shared.connection.channel().await?;
            channel.cancel(&target.queue_name).await?;
            channel.delete_queue(&target.queue_name).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                shared.registry.remove(&id);
                info!(
                    "Unsubscribed from '{}' (queue {} deleted)",
                    target.pattern, target.queue_name
                );
                true
            }
            Err(e) => {
                error!("Unsubscribe from '{}' failed: {}", target.pattern, e);
                false
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = lock(&self.shared.worker);
        if worker.is_some() {
            return;
        }
        let Some(inbound) = lock(&self.shared.inbound_rx).take() else {
            return;
        };

        let shared = self.shared.clone();
        let span = tracing::info_span!("consume_loop", exchange = %shared.connection.exchange());
        *worker = Some(tokio::spawn(run_loop(shared, inbound).instrument(span)));
    }

    /// Stop the consume loop and close the connection.
    ///
    /// Subscriptions stay registered and their durable queues keep buffering
    /// on the broker. Use [`Consumer::close`] to remove them.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.connection.request_stop();

        let worker = lock(&shared.worker).take();
        if let Some(mut handle) = worker {
            match tokio::time::timeout(shared.options.join_timeout, &mut handle).await {
                Ok(_) => debug!("Consume loop joined"),
                Err(_) => {
                    warn!(
                        "Consume loop did not stop within {:?}, aborting",
                        shared.options.join_timeout
                    );
                    handle.abort();
                }
            }
        }

        shared.connection.disconnect().await;
        shared.registry.abort_forwarders();
        shared.transition(ConsumerEvent::StopRequested);
    }

    /// Unsubscribe everything, then disconnect
    pub async fn close(&self) {
        for id in self.shared.registry.ids() {
            self.unsubscribe(id).await;
        }
        let leftover = self.shared.registry.len();
        if leftover > 0 {
            warn!("{} subscription queue(s) could not be deleted", leftover);
        }
        self.disconnect().await;
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.connection.request_stop();
        if let Some(handle) = lock(&self.shared.worker).take() {
            handle.abort();
        }
        self.shared.registry.abort_forwarders();
    }
}

impl Shared {
    fn transition(&self, event: ConsumerEvent) {
        let current = *self.state_tx.borrow();
        let next = HealthMonitor::next_state(current, &event);
        HealthMonitor::log_state_transition(current, next);
        self.state_tx.send_replace(next);
    }

    /// Declare, bind and start consuming one subscription's queue
    async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        target: &BindTarget,
        generation: u64,
    ) -> BusResult<()> {
        channel.declare_queue(&target.queue_name).await?;
        channel
            .bind_queue(&target.queue_name, self.connection.exchange(), &target.pattern)
            .await?;
        let stream = channel
            .consume(&target.queue_name, &target.queue_name)
            .await?;

        let forwarder = tokio::spawn(forward(
            stream,
            target.id,
            generation,
            self.inbound_tx.clone(),
        ));
        self.registry.mark_bound(&target.id, generation, forwarder);
        Ok(())
    }

    /// Reconnect if needed and rebind every subscription that lacks a live
    /// consumer on the current connection
    async fn restore(&self) -> BusResult<()> {
        let _guard = self.bind_lock.lock().await;
        let channel = self.connection.channel().await?;
        let generation = self.connection.generation();

        for target in self.registry.needing_rebind(generation) {
            self.bind(channel.as_ref(), &target, generation).await?;
            info!("Rebound '{}' (queue {})", target.pattern, target.queue_name);
        }
        Ok(())
    }

    async fn dispatch(&self, subscription: SubscriptionId, delivery: Delivery) {
        let Some(handler) = self.registry.handler(&subscription) else {
            debug!(
                "Dropping delivery on '{}' for removed subscription",
                delivery.routing_key
            );
            return;
        };

        let payload: Value = match serde_json::from_slice(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                let error = BusError::decode(e.to_string());
                error!("Dropping message on '{}': {}", delivery.routing_key, error);
                return;
            }
        };

        let envelope = Envelope {
            topic: delivery.routing_key,
            payload,
            delivery_tag: delivery.delivery_tag,
        };
        let topic = envelope.topic.clone();

        if AssertUnwindSafe(handler.handle(envelope))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Subscriber callback panicked on '{}'", topic);
            let mut shutdown = self.connection.shutdown_signal();
            interruptible_sleep(&mut shutdown, self.options.error_backoff).await;
        }
    }
}

async fn forward(
    mut stream: DeliveryStream,
    subscription: SubscriptionId,
    generation: u64,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => {
                if tx
                    .send(Inbound::Delivery {
                        subscription,
                        delivery,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    let _ = tx.send(Inbound::StreamEnded {
        subscription,
        generation,
        error,
    });
}

async fn run_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    let mut shutdown = shared.connection.shutdown_signal();
    shared.transition(ConsumerEvent::LoopStarted);

    'restore: loop {
        if let Err(e) = shared.restore().await {
            let decision = HealthMonitor::after_failure(
                &e,
                shared.connection.is_stopping(),
                shared.options.connection_backoff,
                shared.options.error_backoff,
            );
            HealthMonitor::log_failure(&e, &decision);
            match decision {
                LoopDecision::Exit => break 'restore,
                LoopDecision::RetryAfter { delay } => {
                    shared.transition(ConsumerEvent::RestoreFailed(e.to_string()));
                    if !interruptible_sleep(&mut shutdown, delay).await {
                        break 'restore;
                    }
                    continue 'restore;
                }
            }
        }
        shared.transition(ConsumerEvent::Restored);

        let mut health = tokio::time::interval(shared.options.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        health.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'restore;
                    }
                }
                message = inbound.recv() => match message {
                    None => break 'restore,
                    Some(Inbound::Delivery { subscription, delivery }) => {
                        shared.dispatch(subscription, delivery).await;
                    }
                    Some(Inbound::StreamEnded { subscription, generation, error }) => {
                        if shared.registry.mark_unbound_if(&subscription, generation) {
                            let reason = error
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "consumer cancelled by broker".to_string());
                            warn!("Consumer stream ended: {}", reason);
                            shared.transition(ConsumerEvent::ConnectionLost(reason));
                            continue 'restore;
                        }
                    }
                },
                _ = health.tick() => {
                    if !shared.connection.is_open().await && !shared.connection.is_stopping() {
                        shared.transition(ConsumerEvent::ConnectionLost(
                            "broker connection closed".to_string(),
                        ));
                        continue 'restore;
                    }
                }
            }
        }
    }

    debug!("Consume loop exited");
}
