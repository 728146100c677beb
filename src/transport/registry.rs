//! Subscription bookkeeping
//!
//! Entries live here from a successful subscribe until a successful
//! unsubscribe. Each records the broker queue it owns and whether that queue
//! currently has a live consumer on the present connection.

use super::EnvelopeHandler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque handle returned by `Consumer::subscribe`
pub type SubscriptionId = Uuid;

/// One pattern binding owned by a consumer
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
    /// Broker queue owned by this subscription; doubles as the consumer tag
    pub queue_name: String,
    pub handler: Arc<dyn EnvelopeHandler>,
    bound_generation: Option<u64>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        pattern: impl Into<String>,
        queue_name: impl Into<String>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Self {
        Self {
            id,
            pattern: pattern.into(),
            queue_name: queue_name.into(),
            handler,
            bound_generation: None,
            forwarder: None,
        }
    }

    /// Connection generation the live consumer was started on
    pub fn bound_generation(&self) -> Option<u64> {
        self.bound_generation
    }

    fn stop_forwarder(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("queue_name", &self.queue_name)
            .field("bound_generation", &self.bound_generation)
            .finish()
    }
}

/// What a rebind needs to know about a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct BindTarget {
    pub id: SubscriptionId,
    pub pattern: String,
    pub queue_name: String,
}

/// Thread-safe map of subscriptions keyed by id
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, subscription: Subscription) {
        self.lock().insert(subscription.id, subscription);
    }

    /// Remove an entry and stop its forwarder. Returns whether it existed.
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        match self.lock().remove(id) {
            Some(mut subscription) => {
                subscription.stop_forwarder();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn contains_queue(&self, queue_name: &str) -> bool {
        self.lock().values().any(|s| s.queue_name == queue_name)
    }

    pub fn handler(&self, id: &SubscriptionId) -> Option<Arc<dyn EnvelopeHandler>> {
        self.lock().get(id).map(|s| s.handler.clone())
    }

    pub fn target(&self, id: &SubscriptionId) -> Option<BindTarget> {
        self.lock().get(id).map(|s| BindTarget {
            id: s.id,
            pattern: s.pattern.clone(),
            queue_name: s.queue_name.clone(),
        })
    }

    pub fn pattern(&self, id: &SubscriptionId) -> Option<String> {
        self.lock().get(id).map(|s| s.pattern.clone())
    }

    /// Record a live consumer started on connection `generation`.
    ///
    /// Returns `false` (and aborts `forwarder`) if the subscription was
    /// removed in the meantime.
    pub fn mark_bound(
        &self,
        id: &SubscriptionId,
        generation: u64,
        forwarder: JoinHandle<()>,
    ) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(subscription) => {
                subscription.stop_forwarder();
                subscription.bound_generation = Some(generation);
                subscription.forwarder = Some(forwarder);
                true
            }
            None => {
                forwarder.abort();
                false
            }
        }
    }

    /// Clear the bound flag if it still refers to `generation`.
    ///
    /// A stream ending from an older connection must not unbind a consumer
    /// that was already restored on a newer one.
    pub fn mark_unbound_if(&self, id: &SubscriptionId, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(subscription) if subscription.bound_generation == Some(generation) => {
                subscription.bound_generation = None;
                subscription.forwarder = None;
                true
            }
            _ => false,
        }
    }

    /// Stop forwarding for one subscription ahead of cancelling its consumer,
    /// so the cancellation is not mistaken for a lost stream
    pub fn detach(&self, id: &SubscriptionId) {
        if let Some(subscription) = self.lock().get_mut(id) {
            subscription.stop_forwarder();
            subscription.bound_generation = None;
        }
    }

    /// Subscriptions without a live consumer on connection `generation`
    pub fn needing_rebind(&self, generation: u64) -> Vec<BindTarget> {
        let mut targets: Vec<BindTarget> = self
            .lock()
            .values()
            .filter(|s| s.bound_generation != Some(generation))
            .map(|s| BindTarget {
                id: s.id,
                pattern: s.pattern.clone(),
                queue_name: s.queue_name.clone(),
            })
            .collect();
        targets.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        targets
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.lock().keys().copied().collect()
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.lock().values().map(|s| s.pattern.clone()).collect();
        patterns.sort();
        patterns
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every forwarder and mark all entries unbound. Entries are kept.
    pub fn abort_forwarders(&self) {
        for subscription in self.lock().values_mut() {
            subscription.stop_forwarder();
            subscription.bound_generation = None;
        }
    }
}
