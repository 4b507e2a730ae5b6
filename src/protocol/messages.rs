//! Message types exchanged with the broker
//!
//! A [`Message`] is the immutable envelope created by the gateway; a [`Frame`]
//! is its wire form (topic, JSON body, content type, correlation id and header
//! properties). Outbound cloud events and inbound command kinds live here too.

use crate::protocol::topics::Route;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Content type of every frame body
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header carrying the authentication token
pub const TOKEN_HEADER: &str = "token";
/// Header carrying the message id used for redelivery deduplication
pub const MESSAGE_ID_HEADER: &str = "message-id";
/// Header carrying the device id
pub const DEVICE_ID_HEADER: &str = "device-id";
/// Header carrying the RFC 3339 creation time
pub const TIMESTAMP_HEADER: &str = "timestamp";

/// Immutable message envelope
///
/// The token is never set at creation; it is attached by [`Message::stamped`]
/// right before publishing.
///
/// # Examples
/// ```
/// use fog_connector::protocol::Message;
/// use serde_json::json;
///
/// let message = Message::new("d1", json!({"temp": 21.5}));
/// assert!(message.token.is_none());
///
/// let stamped = message.stamped("secret");
/// assert_eq!(stamped.id, message.id);
/// assert_eq!(stamped.token.as_deref(), Some("secret"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// UUID v4 identity, stable across retries of the same message
    pub id: Uuid,
    pub device_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Correlation id for request/response command flows
    pub correlation_id: Option<String>,
    pub token: Option<String>,
}

impl Message {
    pub fn new(device_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            token: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Copy of this message carrying `token`
    pub fn stamped(&self, token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            ..self.clone()
        }
    }
}

/// Wire representation of a message on a broker topic
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Frame {
    /// Encode a message for publishing on `route`
    pub fn encode(route: &Route, message: &Message) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(&message.payload)?;

        let mut headers = Vec::with_capacity(4);
        if let Some(token) = &message.token {
            headers.push((TOKEN_HEADER.to_string(), token.clone()));
        }
        headers.push((MESSAGE_ID_HEADER.to_string(), message.id.to_string()));
        headers.push((DEVICE_ID_HEADER.to_string(), message.device_id.clone()));
        headers.push((TIMESTAMP_HEADER.to_string(), message.timestamp.to_rfc3339()));

        Ok(Self {
            topic: route.topic.clone(),
            body: Bytes::from(body),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            correlation_id: message.correlation_id.clone(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn token(&self) -> Option<&str> {
        self.header(TOKEN_HEADER)
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.header(MESSAGE_ID_HEADER)
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

/// Kinds of inbound command routes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SendCommand,
    UpdateState,
}

/// Cloud-side device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Last reported state, if the platform exposes one
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub state: Value,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Map::new(),
            state: Value::Null,
        }
    }
}

/// Outcome of an inbound command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Delivered,
    Failed,
}

/// Events published to the broker, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    DeviceAdded {
        device: DeviceRecord,
    },
    DeviceRemoved {
        device_id: String,
    },
    DeviceStateChanged {
        device_id: String,
        state: Value,
    },
    Inventory {
        devices: Vec<DeviceRecord>,
    },
    CloudConnectivity {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CommandResult {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundEvent {
    /// Device the event concerns; `None` for gateway-wide events
    pub fn device_id(&self) -> Option<&str> {
        match self {
            OutboundEvent::DeviceAdded { device } => Some(&device.id),
            OutboundEvent::DeviceRemoved { device_id }
            | OutboundEvent::DeviceStateChanged { device_id, .. }
            | OutboundEvent::CommandResult { device_id, .. } => Some(device_id),
            OutboundEvent::Inventory { .. } | OutboundEvent::CloudConnectivity { .. } => None,
        }
    }

    pub fn route_key(&self) -> crate::protocol::RouteKey {
        use crate::protocol::RouteKey;
        match self {
            OutboundEvent::DeviceAdded { .. } => RouteKey::DeviceAdded,
            OutboundEvent::DeviceRemoved { .. } => RouteKey::DeviceRemoved,
            OutboundEvent::DeviceStateChanged { .. } => RouteKey::DeviceState,
            OutboundEvent::Inventory { .. } => RouteKey::Inventory,
            OutboundEvent::CloudConnectivity { .. } => RouteKey::Connectivity,
            OutboundEvent::CommandResult { .. } => RouteKey::CommandResult,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            OutboundEvent::CommandResult { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }
}

/// A command forwarded to a device through the cloud platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeviceCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_encoding_carries_properties() {
        let route = Route::new("device_state", "fog/devices/d1/state");
        let message = Message::new("d1", json!({"on": true}))
            .with_correlation_id(Some("c-1".to_string()))
            .stamped("tok-1");

        let frame = Frame::encode(&route, &message).unwrap();

        assert_eq!(frame.topic, "fog/devices/d1/state");
        assert_eq!(frame.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(frame.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(frame.token(), Some("tok-1"));
        assert_eq!(frame.message_id(), Some(message.id));
        assert_eq!(frame.header(DEVICE_ID_HEADER), Some("d1"));

        // Token travels as a header, never in the body
        let body: Value = serde_json::from_slice(&frame.body).unwrap();
        assert_eq!(body, json!({"on": true}));
    }

    #[test]
    fn test_unstamped_frame_has_no_token() {
        let route = Route::new("inventory", "fog/cloud/inventory");
        let frame = Frame::encode(&route, &Message::new("gw", json!({}))).unwrap();
        assert!(frame.token().is_none());
    }

    #[test]
    fn test_outbound_event_shapes() {
        let event = OutboundEvent::DeviceStateChanged {
            device_id: "d1".to_string(),
            state: json!({"temp": 20}),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "device_state_changed", "device_id": "d1", "state": {"temp": 20}})
        );

        let connectivity = OutboundEvent::CloudConnectivity {
            connected: false,
            reason: Some("poll failed".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&connectivity).unwrap(),
            json!({"type": "cloud_connectivity", "connected": false, "reason": "poll failed"})
        );
        assert_eq!(connectivity.device_id(), None);
    }

    #[test]
    fn test_command_result_shape() {
        let event = OutboundEvent::CommandResult {
            device_id: "d2".to_string(),
            correlation_id: Some("req-9".to_string()),
            status: CommandStatus::Failed,
            error: Some("timeout".to_string()),
        };
        assert_eq!(event.correlation_id(), Some("req-9"));
        assert_eq!(
            serde_json::to_value(&event).unwrap()["status"],
            json!("failed")
        );
    }

    #[test]
    fn test_device_record_defaults() {
        let record: DeviceRecord = serde_json::from_value(json!({"id": "d1"})).unwrap();
        assert_eq!(record, DeviceRecord::new("d1"));
    }
}
