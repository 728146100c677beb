//! Broker connection lifecycle
//!
//! A [`BrokerConnection`] holds at most one open connection + channel and the
//! declared topic exchange. `ensure_connected` is the only reconnection
//! trigger; there is no separate background health check at this level.

use super::{Broker, BrokerChannel};
use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Connection state for a broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Connecting (attempt number, 1-based)
    Connecting(u32),
    /// Connection and channel open, exchange declared
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// `disconnect()` was called; no further reconnects
    Stopped,
}

/// One connection + channel to the broker, with the exchange declared on it
pub struct BrokerConnection {
    role: String,
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    stopping: AtomicBool,
    generation: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
}

impl BrokerConnection {
    /// `role` names the connection in logs ("publisher", "consumer", ...)
    pub fn new(role: impl Into<String>, broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            role: role.into(),
            broker,
            config,
            channel: Mutex::new(None),
            stopping: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            shutdown_tx,
            state_tx,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    /// Open the connection and declare the exchange.
    ///
    /// Retries `connection_attempts` times, `retry_delay` apart. A conflicting
    /// exchange declaration fails immediately. Calling this on an open
    /// connection redeclares the exchange, which the broker treats as a no-op.
    pub async fn connect(&self) -> BusResult<()> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref().filter(|c| c.is_open()) {
            return self.declare_exchange(channel.as_ref()).await;
        }
        let span = crate::bus_span!(role = %self.role, operation = "connect");
        self.connect_locked(&mut slot).instrument(span).await
    }

    /// True if connected, otherwise tear down any half-open state and reconnect.
    pub async fn ensure_connected(&self) -> bool {
        match self.channel().await {
            Ok(_) => true,
            Err(e) => {
                debug!("[{}] ensure_connected failed: {}", self.role, e);
                false
            }
        }
    }

    /// The open channel, reconnecting first if needed
    pub async fn channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        if self.is_stopping() {
            return Err(BusError::Stopped);
        }

        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }

        if let Some(stale) = slot.take() {
            warn!("[{}] Broker channel closed, reconnecting", self.role);
            self.set_state(ConnectionState::Disconnected(
                "channel closed".to_string(),
            ));
            if let Err(e) = stale.close().await {
                debug!("[{}] Error closing stale channel: {}", self.role, e);
            }
        }

        let span = crate::bus_span!(role = %self.role, operation = "reconnect");
        self.connect_locked(&mut slot).instrument(span).await?;
        slot.clone().ok_or(BusError::NotConnected)
    }

    async fn connect_locked(&self, slot: &mut Option<Arc<dyn BrokerChannel>>) -> BusResult<()> {
        let attempts = self.config.connection_attempts.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut last_error = BusError::NotConnected;

        for attempt in 1..=attempts {
            if self.is_stopping() {
                return Err(BusError::Stopped);
            }
            self.set_state(ConnectionState::Connecting(attempt));

            match self.open_and_declare().await {
                Ok(channel) => {
                    *slot = Some(channel);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(ConnectionState::Connected);
                    info!(
                        "[{}] Connected to {} (exchange '{}', generation {})",
                        self.role,
                        self.config.display_uri(),
                        self.config.exchange,
                        generation
                    );
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("[{}] Broker setup failed: {}", self.role, e);
                    self.set_state(ConnectionState::Disconnected(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "[{}] Connection attempt {}/{} failed: {}",
                        self.role, attempt, attempts, e
                    );
                    last_error = e;
                }
            }

            if attempt < attempts
                && !interruptible_sleep(&mut shutdown_rx, self.config.retry_delay()).await
            {
                return Err(BusError::Stopped);
            }
        }

        self.set_state(ConnectionState::Disconnected(last_error.to_string()));
        Err(last_error)
    }

    async fn open_and_declare(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        let channel = self.broker.open(&self.config).await?;
        if let Err(e) = self.declare_exchange(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                debug!("[{}] Error closing channel: {}", self.role, close_err);
            }
            return Err(e);
        }
        Ok(channel)
    }

    async fn declare_exchange(&self, channel: &dyn BrokerChannel) -> BusResult<()> {
        channel
            .declare_exchange(&self.config.exchange, &self.config.exchange_type, true)
            .await
    }

    /// Set the stopping flag and wake anything sleeping between retries.
    /// Does not close the connection.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }

    /// Stop reconnecting, then close channel and connection. Close errors are logged.
    pub async fn disconnect(&self) {
        self.request_stop();

        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.take() {
            match channel.close().await {
                Ok(()) => info!("[{}] Broker connection closed", self.role),
                Err(e) => warn!("[{}] Error while closing broker connection: {}", self.role, e),
            }
        }
        self.set_state(ConnectionState::Stopped);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether a channel is currently open, without reconnecting
    pub async fn is_open(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Incremented on every successful connect; lets callers detect reconnects
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Receiver that flips to `true` once a stop is requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` if shutdown was requested.
pub(crate) async fn interruptible_sleep(
    shutdown_rx: &mut watch::Receiver<bool>,
    delay: Duration,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    tokio::select! {
        changed = shutdown_rx.changed() => {
            match changed {
                Ok(()) if *shutdown_rx.borrow() => {
                    info!("Shutdown signal received during retry delay, stopping");
                    false
                }
                _ => {
                    tokio::time::sleep(delay).await;
                    true
                }
            }
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
