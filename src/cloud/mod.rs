//! Cloud IoT platform abstraction
//!
//! A [`CloudConnector`] owns the single session to the cloud platform. The
//! bridge reads devices from it, forwards commands and state updates to it,
//! and consumes its lifecycle events through one channel.

pub mod factory;
pub mod providers;

pub use factory::CloudConnectorFactory;
pub use providers::*;

use crate::protocol::{DeviceCommand, DeviceRecord};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle and fleet events emitted by a connector, in order
#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    Connected,
    Disconnected { reason: String },
    DeviceAdded(DeviceRecord),
    DeviceRemoved { device_id: String },
    DeviceStateChanged { device_id: String, state: Value },
}

impl CloudEvent {
    /// Device the event concerns; `None` for session events
    pub fn device_id(&self) -> Option<&str> {
        match self {
            CloudEvent::DeviceAdded(device) => Some(&device.id),
            CloudEvent::DeviceRemoved { device_id }
            | CloudEvent::DeviceStateChanged { device_id, .. } => Some(device_id),
            CloudEvent::Connected | CloudEvent::Disconnected { .. } => None,
        }
    }
}

/// Cloud connector errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CloudError {
    #[error("Cloud unreachable: {0}")]
    Connection(String),
    #[error("Cloud rejected credentials: {0}")]
    Auth(String),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Cloud request failed with status {status}: {message}")]
    Request { status: u16, message: String },
    #[error("Invalid cloud response: {0}")]
    InvalidResponse(String),
    #[error("Cloud connector not started")]
    NotStarted,
    #[error("Cloud connector already started")]
    AlreadyStarted,
    #[error("Cloud event stream already taken")]
    EventsTaken,
}

impl CloudError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Connection(_) => true,
            CloudError::Request { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Capability contract of a cloud platform adapter
#[async_trait]
pub trait CloudConnector: Send + Sync {
    /// Adapter name, e.g. "http"
    fn name(&self) -> &str;

    /// Open the cloud session
    ///
    /// Credential rejection is an error; an unreachable platform is not, the
    /// connector keeps trying and emits [`CloudEvent::Connected`] once it
    /// gets through.
    async fn start(&self) -> Result<(), CloudError>;

    async fn stop(&self) -> Result<(), CloudError>;

    /// Current device inventory
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CloudError>;

    async fn send_command(&self, device_id: &str, command: &DeviceCommand)
        -> Result<(), CloudError>;

    async fn update_state(&self, device_id: &str, state: &Value) -> Result<(), CloudError>;

    /// Take the event stream; there is exactly one consumer
    fn subscribe(&self) -> Result<mpsc::Receiver<CloudEvent>, CloudError>;

    fn is_connected(&self) -> bool;
}
