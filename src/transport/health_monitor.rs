//! Pure reconnection decisions and session health metrics

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the supervisor should try again
    ///
    /// Connection failures are retried forever with capped backoff; only a run
    /// of consecutive auth rejections or a shutdown request stops the loop.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        consecutive_auth_failures: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if consecutive_auth_failures >= config.max_auth_failures {
            return ReconnectionDecision::AbortAuthRejected {
                failures: consecutive_auth_failures,
            };
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next state after a session lifecycle event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::SessionOpened => ConnectionState::Connected,
            ConnectionEvent::ConnectFailed(_) => ConnectionState::Disconnected,
            ConnectionEvent::SessionLost(_) => ConnectionState::Reconnecting(1),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::AuthEscalated(_) | ConnectionEvent::CloseRequested => {
                ConnectionState::Closed
            }
        }
    }

    /// Publishing goes straight to the session
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Publishing is parked in the outbox until the session is restored
    pub fn should_buffer(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Reconnecting(_))
    }

    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        reconnect_count: u32,
        state: &ConnectionState,
    ) -> HealthMetrics {
        let connected = matches!(state, ConnectionState::Connected);
        HealthMetrics {
            uptime: connect_time
                .filter(|_| connected)
                .map(|t| Instant::now().duration_since(t)),
            reconnect_count,
            is_healthy: connected,
        }
    }

    /// Log a state transition at a level matching its severity
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker session established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!("Broker session lost, reconnecting");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempts = attempt, "Broker reconnection successful");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Closed) => {
                error!("Broker reconnection abandoned");
            }
            (from, to) if from != to => {
                info!("Broker connection state: {} -> {}", from, to);
            }
            _ => {}
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after the delay
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - the broker keeps rejecting our credentials
    AbortAuthRejected { failures: u32 },
}

/// Session lifecycle events that drive state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted,
    SessionOpened,
    ConnectFailed(String),
    SessionLost(String),
    ReconnectionStarted(u32),
    AuthEscalated(String),
    CloseRequested,
}

/// Health metrics for the broker session
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session was established
    pub uptime: Option<Duration>,
    /// Number of successful reconnections
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 80,
            multiplier: 2.0,
            max_auth_failures: 2,
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = config();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, 0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(10, 0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 11,
                delay_ms: 80
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, 0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_auth_failures_escalate() {
        let config = config();

        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(3, 1, &config, false),
            ReconnectionDecision::Proceed { .. }
        ));
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, 2, &config, false),
            ReconnectionDecision::AbortAuthRejected { failures: 2 }
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnectStarted),
            ConnectionState::Connecting
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::SessionOpened),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnectFailed("x".into())),
            ConnectionState::Disconnected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::SessionLost("eof".into())),
            ConnectionState::Reconnecting(1)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(4)),
            ConnectionState::Reconnecting(4)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::AuthEscalated("denied".into())),
            ConnectionState::Closed
        );
    }

    #[test]
    fn test_publish_gating() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(HealthMonitor::should_buffer(&ConnectionState::Reconnecting(2)));
        assert!(!HealthMonitor::should_buffer(&ConnectionState::Disconnected));
        assert!(!HealthMonitor::should_buffer(&ConnectionState::Closed));
    }

    #[test]
    fn test_calculate_health_metrics() {
        let connected_at = Some(Instant::now() - Duration::from_secs(60));

        let metrics =
            HealthMonitor::calculate_health_metrics(connected_at, 2, &ConnectionState::Connected);
        assert!(metrics.is_healthy);
        assert!(metrics.uptime.unwrap() >= Duration::from_secs(60));
        assert_eq!(metrics.reconnect_count, 2);

        let metrics = HealthMonitor::calculate_health_metrics(
            connected_at,
            2,
            &ConnectionState::Reconnecting(1),
        );
        assert!(!metrics.is_healthy);
        assert!(metrics.uptime.is_none());
    }
}
