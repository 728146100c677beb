//! Pure state tracking and backoff decisions for the consume loop
//!
//! The consume loop in [`super::consumer`] does the I/O; every decision about
//! what state it is in and how long to wait after a failure is made here.

use crate::error::BusError;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle of a consumer
///
/// `Idle → Connecting → Consuming ⇄ Reconnecting → Stopped`. `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No consume loop has been started yet
    Idle,
    /// Loop started, first connection not yet established
    Connecting,
    /// All subscriptions bound, deliveries flowing
    Consuming,
    /// Connection or a consumer stream was lost; restoring bindings
    Reconnecting,
    /// Explicitly disconnected
    Stopped,
}

/// Events observed by the consume loop
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// Worker spawned
    LoopStarted,
    /// Connection up and every subscription bound
    Restored,
    /// Restoring the connection or bindings failed
    RestoreFailed(String),
    /// A consumer stream ended or the health check found the connection closed
    ConnectionLost(String),
    /// `disconnect()` was called
    StopRequested,
}

/// What the loop should do after a failed restore attempt
#[derive(Debug, PartialEq)]
pub enum LoopDecision {
    /// Sleep for `delay` and try again
    RetryAfter { delay: Duration },
    /// Leave the loop
    Exit,
}

/// Pure decision logic for the consume loop
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine next state after a loop event (pure function)
    pub fn next_state(current: ConsumerState, event: &ConsumerEvent) -> ConsumerState {
        use ConsumerState::*;

        match (current, event) {
            (Stopped, _) => Stopped,
            (_, ConsumerEvent::StopRequested) => Stopped,
            (Idle, ConsumerEvent::LoopStarted) => Connecting,
            (Connecting | Reconnecting, ConsumerEvent::Restored) => Consuming,
            (Consuming, ConsumerEvent::Restored) => Consuming,
            (Connecting, ConsumerEvent::RestoreFailed(_)) => Connecting,
            (Reconnecting, ConsumerEvent::RestoreFailed(_)) => Reconnecting,
            (Consuming, ConsumerEvent::RestoreFailed(_)) => Reconnecting,
            (Consuming, ConsumerEvent::ConnectionLost(_)) => Reconnecting,
            (state, _) => state,
        }
    }

    /// Decide how the loop reacts to a failed restore (pure function)
    ///
    /// Connection errors wait the long backoff, anything else the short one.
    /// Only an explicit stop ends the loop.
    pub fn after_failure(
        error: &BusError,
        stopping: bool,
        connection_backoff: Duration,
        error_backoff: Duration,
    ) -> LoopDecision {
        if stopping || matches!(error, BusError::Stopped) {
            return LoopDecision::Exit;
        }

        let delay = if error.is_connection() || matches!(error, BusError::Configuration(_)) {
            connection_backoff
        } else {
            error_backoff
        };
        LoopDecision::RetryAfter { delay }
    }

    /// Check if a state accepts new subscriptions (pure function)
    pub fn accepts_subscriptions(state: ConsumerState) -> bool {
        !matches!(state, ConsumerState::Stopped)
    }

    /// Log consumer state transition
    pub fn log_state_transition(from: ConsumerState, to: ConsumerState) {
        match (from, to) {
            (a, b) if a == b => {}
            (ConsumerState::Connecting, ConsumerState::Consuming) => {
                info!("Consumer bound and consuming");
            }
            (ConsumerState::Consuming, ConsumerState::Reconnecting) => {
                warn!("Consumer lost its broker connection, restoring bindings");
            }
            (ConsumerState::Reconnecting, ConsumerState::Consuming) => {
                info!("Consumer reconnected, bindings restored");
            }
            (_, ConsumerState::Stopped) => {
                info!("Consumer stopped");
            }
            _ => {
                info!("Consumer state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Log a failed restore attempt with the chosen delay
    pub fn log_failure(error: &BusError, decision: &LoopDecision) {
        match decision {
            LoopDecision::RetryAfter { delay } if error.is_connection() => {
                warn!("Broker unavailable ({}), retrying in {:?}", error, delay);
            }
            LoopDecision::RetryAfter { delay } => {
                error!("Consume loop error ({}), retrying in {:?}", error, delay);
            }
            LoopDecision::Exit => {
                info!("Consume loop exiting: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_secs(1);

    #[test]
    fn test_happy_path_transitions() {
        let state = ConsumerState::Idle;
        let state = HealthMonitor::next_state(state, &ConsumerEvent::LoopStarted);
        assert_eq!(state, ConsumerState::Connecting);

        let state = HealthMonitor::next_state(state, &ConsumerEvent::Restored);
        assert_eq!(state, ConsumerState::Consuming);

        let state =
            HealthMonitor::next_state(state, &ConsumerEvent::ConnectionLost("reset".into()));
        assert_eq!(state, ConsumerState::Reconnecting);

        let state =
            HealthMonitor::next_state(state, &ConsumerEvent::RestoreFailed("refused".into()));
        assert_eq!(state, ConsumerState::Reconnecting);

        let state = HealthMonitor::next_state(state, &ConsumerEvent::Restored);
        assert_eq!(state, ConsumerState::Consuming);
    }

    #[test]
    fn test_initial_connect_failures_stay_connecting() {
        let state = HealthMonitor::next_state(
            ConsumerState::Connecting,
            &ConsumerEvent::RestoreFailed("refused".into()),
        );
        assert_eq!(state, ConsumerState::Connecting);
    }

    #[test]
    fn test_stopped_is_terminal() {
        for state in [
            ConsumerState::Idle,
            ConsumerState::Connecting,
            ConsumerState::Consuming,
            ConsumerState::Reconnecting,
        ] {
            assert_eq!(
                HealthMonitor::next_state(state, &ConsumerEvent::StopRequested),
                ConsumerState::Stopped
            );
        }

        for event in [
            ConsumerEvent::LoopStarted,
            ConsumerEvent::Restored,
            ConsumerEvent::ConnectionLost("x".into()),
        ] {
            assert_eq!(
                HealthMonitor::next_state(ConsumerState::Stopped, &event),
                ConsumerState::Stopped
            );
        }
    }

    #[test]
    fn test_idle_ignores_unrelated_events() {
        assert_eq!(
            HealthMonitor::next_state(ConsumerState::Idle, &ConsumerEvent::Restored),
            ConsumerState::Idle
        );
    }

    #[test]
    fn test_connection_errors_use_long_backoff() {
        let decision =
            HealthMonitor::after_failure(&BusError::connection("refused"), false, LONG, SHORT);
        assert_eq!(decision, LoopDecision::RetryAfter { delay: LONG });

        let decision = HealthMonitor::after_failure(&BusError::NotConnected, false, LONG, SHORT);
        assert_eq!(decision, LoopDecision::RetryAfter { delay: LONG });
    }

    #[test]
    fn test_other_errors_use_short_backoff() {
        let decision =
            HealthMonitor::after_failure(&BusError::channel("NOT_FOUND"), false, LONG, SHORT);
        assert_eq!(decision, LoopDecision::RetryAfter { delay: SHORT });
    }

    #[test]
    fn test_stop_exits_loop() {
        let decision =
            HealthMonitor::after_failure(&BusError::connection("refused"), true, LONG, SHORT);
        assert_eq!(decision, LoopDecision::Exit);

        let decision = HealthMonitor::after_failure(&BusError::Stopped, false, LONG, SHORT);
        assert_eq!(decision, LoopDecision::Exit);
    }

    #[test]
    fn test_accepts_subscriptions() {
        assert!(HealthMonitor::accepts_subscriptions(ConsumerState::Idle));
        assert!(HealthMonitor::accepts_subscriptions(ConsumerState::Reconnecting));
        assert!(!HealthMonitor::accepts_subscriptions(ConsumerState::Stopped));
    }
}
