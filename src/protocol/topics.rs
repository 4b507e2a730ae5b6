//! Topic canonicalization, identifier validation and the route table
//!
//! Routes map logical channels (an event kind, optionally bound to a device id)
//! onto concrete broker topics. The table is built once from configuration and
//! never changes afterwards.

use crate::config::RoutesSection;
use crate::protocol::messages::CommandKind;
use thiserror::Error;

/// Placeholder substituted with the device id in route templates
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

/// Normalize a broker topic: collapse repeated separators and strip
/// separators at either end.
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an identifier against `[a-zA-Z0-9._-]+`
pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidIdentifierChar(ch));
        }
    }

    Ok(())
}

/// Check that a device id can be embedded as a single topic segment
pub fn validate_topic_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }
    match segment.chars().find(|ch| matches!(ch, '/' | '+' | '#' | '\0')) {
        Some(ch) => Err(ValidationError::InvalidIdentifierChar(ch)),
        None => Ok(()),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validation errors for identifiers and topic segments
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Identifier cannot be empty")]
    EmptyIdentifier,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidIdentifierChar(char),
}

/// Route resolution errors
#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("Route '{0}' requires a device id")]
    MissingDeviceId(String),
    #[error("Device id '{device_id}' cannot be used in a topic: {source}")]
    InvalidDeviceId {
        device_id: String,
        source: ValidationError,
    },
}

/// Logical outbound channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKey {
    DeviceAdded,
    DeviceRemoved,
    DeviceState,
    Inventory,
    Connectivity,
    CommandResult,
}

impl RouteKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKey::DeviceAdded => "device_added",
            RouteKey::DeviceRemoved => "device_removed",
            RouteKey::DeviceState => "device_state",
            RouteKey::Inventory => "inventory",
            RouteKey::Connectivity => "connectivity",
            RouteKey::CommandResult => "command_result",
        }
    }
}

/// A named channel resolved to its concrete broker topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub name: String,
    pub topic: String,
}

impl Route {
    pub fn new(name: impl Into<String>, topic: &str) -> Self {
        Self {
            name: name.into(),
            topic: canonicalize_topic(topic),
        }
    }
}

/// Inbound route together with the command kind it carries
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRoute {
    pub route: Route,
    pub kind: CommandKind,
}

/// Immutable mapping from logical channels to topics
#[derive(Debug, Clone)]
pub struct RouteTable {
    device_added: String,
    device_removed: String,
    device_state: String,
    inventory: String,
    connectivity: String,
    command_result: String,
    commands: Vec<CommandRoute>,
}

impl RouteTable {
    pub fn from_config(routes: &RoutesSection) -> Self {
        Self {
            device_added: canonicalize_topic(&routes.device_added),
            device_removed: canonicalize_topic(&routes.device_removed),
            device_state: canonicalize_topic(&routes.device_state),
            inventory: canonicalize_topic(&routes.inventory),
            connectivity: canonicalize_topic(&routes.connectivity),
            command_result: canonicalize_topic(&routes.command_result),
            commands: routes
                .commands
                .iter()
                .map(|c| CommandRoute {
                    route: Route::new(c.name.clone(), &c.topic),
                    kind: c.kind,
                })
                .collect(),
        }
    }

    fn template(&self, key: RouteKey) -> &str {
        match key {
            RouteKey::DeviceAdded => &self.device_added,
            RouteKey::DeviceRemoved => &self.device_removed,
            RouteKey::DeviceState => &self.device_state,
            RouteKey::Inventory => &self.inventory,
            RouteKey::Connectivity => &self.connectivity,
            RouteKey::CommandResult => &self.command_result,
        }
    }

    /// Resolve an outbound channel, substituting the device id if the
    /// template contains one.
    pub fn resolve(&self, key: RouteKey, device_id: Option<&str>) -> Result<Route, RouteError> {
        let template = self.template(key);
        if !template.contains(DEVICE_ID_PLACEHOLDER) {
            return Ok(Route {
                name: key.as_str().to_string(),
                topic: template.to_string(),
            });
        }

        let device_id =
            device_id.ok_or_else(|| RouteError::MissingDeviceId(key.as_str().to_string()))?;
        validate_topic_segment(device_id).map_err(|source| RouteError::InvalidDeviceId {
            device_id: device_id.to_string(),
            source,
        })?;

        Ok(Route {
            name: key.as_str().to_string(),
            topic: template.replace(DEVICE_ID_PLACEHOLDER, device_id),
        })
    }

    pub fn command_routes(&self) -> &[CommandRoute] {
        &self.commands
    }
}
