//! Broker connection state, reconnection policy and transport errors
//!
//! Everything here is pure: the reconnect supervisor in [`super::broker`]
//! consults these types but owns all I/O.

use crate::config::ReconnectSection;
use thiserror::Error;

/// Lifecycle state of the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or the initial connection attempt failed
    Disconnected,
    /// Initial connection attempt in progress
    Connecting,
    /// Session established and ready for operations
    Connected,
    /// Session lost; reconnection attempt number
    Reconnecting(u32),
    /// Stopped on request or after auth escalation; terminal
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Capped exponential backoff with auth escalation
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive auth rejections before reconnection stops
    pub max_auth_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier: section.multiplier,
            max_auth_failures: section.max_auth_failures,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before the given attempt (1-based): `initial * multiplier^(attempt-1)`,
    /// never above `max_delay_ms`.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }
}

/// Broker transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Broker rejected credentials: {0}")]
    AuthRejected(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Broker rejected message token")]
    TokenRejected,
    #[error("Outbound buffer full ({capacity} messages)")]
    Backpressure { capacity: usize },
    #[error("Subscription to '{topic}' failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether the error is a credential rejection at session level
    pub fn is_auth(&self) -> bool {
        matches!(self, BrokerError::AuthRejected(_))
    }
}
