//! Gateway-wide error taxonomy
//!
//! Each layer keeps its own error enum (`ConfigError`, `BrokerError`,
//! `CloudError`, `TokenError`, `DecodeError`). [`GatewayError`] folds them
//! into the categories the gateway reacts to: session-level failures,
//! per-message failures on either direction, and fatal startup conditions.

use crate::auth::TokenError;
use crate::cloud::CloudError;
use crate::config::ConfigError;
use crate::protocol::DecodeError;
use crate::transport::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest error text that reaches logs or the broker
const MAX_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret|bearer)[=:]\s*\S+").ok());

static SECRET_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Outbound buffer full ({capacity} messages)")]
    Backpressure { capacity: usize },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("Dispatch to device {device_id} failed after {attempts} attempts: {reason}")]
    Dispatch {
        device_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Startup failed: {0}")]
    Startup(String),
}

impl GatewayError {
    /// Conditions that end the process when they happen during startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Config(_) | GatewayError::Auth(_) | GatewayError::Startup(_)
        ) || matches!(self, GatewayError::Cloud(CloudError::Auth(_)))
    }

    /// Error text safe to log or publish
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

impl From<BrokerError> for GatewayError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::AuthRejected(reason) => GatewayError::Auth(reason),
            BrokerError::Backpressure { capacity } => GatewayError::Backpressure { capacity },
            e @ (BrokerError::PublishFailed(_)
            | BrokerError::TokenRejected
            | BrokerError::SubscriptionFailed { .. }) => GatewayError::Publish(e.to_string()),
            e @ (BrokerError::ConnectionFailed(_)
            | BrokerError::InvalidBrokerUrl(_)
            | BrokerError::NotConnected { .. }
            | BrokerError::Closed) => GatewayError::Connection(e.to_string()),
        }
    }
}

impl From<TokenError> for GatewayError {
    fn from(error: TokenError) -> Self {
        GatewayError::Auth(error.to_string())
    }
}

/// Strip credentials and secret paths from error text and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(pattern) = SECRET_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
