//! Inbound command payload schemas
//!
//! Each command route carries one [`CommandKind`]. Payloads are checked
//! against a JSON schema generated from the payload type before they are
//! deserialized, so a malformed message fails with a precise error location.

use crate::protocol::messages::{CommandKind, DeviceCommand, Frame};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Body of a `send_command` route
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SendCommandPayload {
    pub device_id: String,
    pub command: DeviceCommand,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Body of an `update_state` route
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatePayload {
    pub device_id: String,
    pub state: Map<String, Value>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Operation requested by an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    SendCommand(DeviceCommand),
    UpdateState(Value),
}

/// A validated inbound message ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub device_id: String,
    pub correlation_id: Option<String>,
    pub message_id: Option<Uuid>,
    pub command: InboundCommand,
}

/// Inbound decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Payload does not match {kind:?} schema: {details}")]
    SchemaViolation { kind: CommandKind, details: String },
    #[error("Schema compilation error: {0}")]
    Schema(String),
}

/// Compiled validators for every command kind
pub struct PayloadDecoder {
    send_command: jsonschema::Validator,
    update_state: jsonschema::Validator,
}

impl std::fmt::Debug for PayloadDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadDecoder").finish_non_exhaustive()
    }
}

impl PayloadDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        Ok(Self {
            send_command: compile(json_schema::<SendCommandPayload>()?)?,
            update_state: compile(json_schema::<UpdateStatePayload>()?)?,
        })
    }

    /// Decode and validate a frame received on a route of `kind`
    ///
    /// A correlation id carried by the frame wins over one in the body.
    pub fn decode(&self, kind: CommandKind, frame: &Frame) -> Result<DecodedCommand, DecodeError> {
        let body: Value = serde_json::from_slice(&frame.body)
            .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

        let validator = match kind {
            CommandKind::SendCommand => &self.send_command,
            CommandKind::UpdateState => &self.update_state,
        };
        validator.validate(&body).map_err(|errors| {
            let details: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            DecodeError::SchemaViolation {
                kind,
                details: details.join("; "),
            }
        })?;

        let violation = |e: serde_json::Error| DecodeError::SchemaViolation {
            kind,
            details: e.to_string(),
        };

        let (device_id, body_correlation, command) = match kind {
            CommandKind::SendCommand => {
                let payload: SendCommandPayload = serde_json::from_value(body).map_err(violation)?;
                (
                    payload.device_id,
                    payload.correlation_id,
                    InboundCommand::SendCommand(payload.command),
                )
            }
            CommandKind::UpdateState => {
                let payload: UpdateStatePayload = serde_json::from_value(body).map_err(violation)?;
                (
                    payload.device_id,
                    payload.correlation_id,
                    InboundCommand::UpdateState(Value::Object(payload.state)),
                )
            }
        };

        Ok(DecodedCommand {
            device_id,
            correlation_id: frame.correlation_id.clone().or(body_correlation),
            message_id: frame.message_id(),
            command,
        })
    }
}

fn json_schema<T: JsonSchema>() -> Result<Value, DecodeError> {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).map_err(|e| DecodeError::Schema(e.to_string()))
}

fn compile(schema: Value) -> Result<jsonschema::Validator, DecodeError> {
    jsonschema::validator_for(&schema).map_err(|e| DecodeError::Schema(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn frame(body: Value, correlation_id: Option<&str>) -> Frame {
        Frame {
            topic: "fog/commands/send".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            content_type: Some("application/json".to_string()),
            correlation_id: correlation_id.map(str::to_string),
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_decode_send_command() {
        let decoder = PayloadDecoder::new().unwrap();
        let body = json!({
            "device_id": "d1",
            "command": {"name": "reboot", "args": {"delay": 5}},
            "correlation_id": "body-corr"
        });

        let decoded = decoder
            .decode(CommandKind::SendCommand, &frame(body, None))
            .unwrap();

        assert_eq!(decoded.device_id, "d1");
        assert_eq!(decoded.correlation_id.as_deref(), Some("body-corr"));
        assert_eq!(
            decoded.command,
            InboundCommand::SendCommand(DeviceCommand {
                name: "reboot".to_string(),
                args: Some(json!({"delay": 5})),
            })
        );
    }

    #[test]
    fn test_frame_correlation_wins() {
        let decoder = PayloadDecoder::new().unwrap();
        let body = json!({"device_id": "d1", "state": {"on": true}, "correlation_id": "body"});

        let decoded = decoder
            .decode(CommandKind::UpdateState, &frame(body, Some("prop")))
            .unwrap();

        assert_eq!(decoded.correlation_id.as_deref(), Some("prop"));
        assert_eq!(decoded.command, InboundCommand::UpdateState(json!({"on": true})));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let decoder = PayloadDecoder::new().unwrap();
        let mut bad = frame(json!({}), None);
        bad.body = Bytes::from_static(b"{not json");

        assert!(matches!(
            decoder.decode(CommandKind::SendCommand, &bad),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_schema_violations_rejected() {
        let decoder = PayloadDecoder::new().unwrap();

        let missing_command = json!({"device_id": "d1"});
        assert!(matches!(
            decoder.decode(CommandKind::SendCommand, &frame(missing_command, None)),
            Err(DecodeError::SchemaViolation { .. })
        ));

        let unknown_field = json!({"device_id": "d1", "state": {}, "extra": 1});
        assert!(matches!(
            decoder.decode(CommandKind::UpdateState, &frame(unknown_field, None)),
            Err(DecodeError::SchemaViolation { .. })
        ));

        let state_not_object = json!({"device_id": "d1", "state": 3});
        assert!(matches!(
            decoder.decode(CommandKind::UpdateState, &frame(state_not_object, None)),
            Err(DecodeError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_send_command_body_is_not_update_state() {
        let decoder = PayloadDecoder::new().unwrap();
        let body = json!({"device_id": "d1", "command": {"name": "x"}});
        assert!(decoder
            .decode(CommandKind::UpdateState, &frame(body, None))
            .is_err());
    }
}
