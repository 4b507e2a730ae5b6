//! Gateway configuration system
//!
//! Configuration is read once at startup from a TOML file and is immutable for
//! the process lifetime. Secrets are referenced by environment variable name
//! and resolved at runtime, never stored in the file itself.

use crate::protocol::{canonicalize_topic, validate_identifier, CommandKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub broker: BrokerSection,
    pub cloud: CloudSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub routes: RoutesSection,
    #[serde(default)]
    pub run_as: RunAsSection,
}

/// Gateway identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Gateway identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Port of the HTTP health server
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

/// On-premises broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with protocol and port (mqtt:// or mqtts://)
    pub broker_url: String,
    /// Environment variable containing the broker username
    pub username_env: Option<String>,
    /// Environment variable containing the broker password
    pub password_env: Option<String>,
    /// Environment variable containing the message token
    pub token_env: Option<String>,
    /// File containing the message token, re-read on every refresh
    pub token_file: Option<PathBuf>,
    /// Lifetime of a token read from `token_file`
    pub token_ttl_secs: Option<u64>,
    /// Publishes buffered while reconnecting before `Backpressure` is returned
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// MQTT keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Consecutive auth rejections tolerated while reconnecting
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_auth_failures: default_max_auth_failures(),
        }
    }
}

/// Cloud platform section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    /// Connector implementation (e.g., "http")
    pub provider: String,
    /// Base URL of the cloud API
    #[serde(default)]
    pub base_url: String,
    /// Environment variable containing the cloud API token
    pub token_env: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cloud_timeout")]
    pub timeout_secs: u64,
}

/// Bridge tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Attempts per inbound command before it is dropped
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Queued jobs per device before new ones are rejected
    #[serde(default = "default_device_queue_capacity")]
    pub device_queue_capacity: usize,
    /// Deliveries buffered per subscription
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            dispatch_attempts: default_dispatch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            device_queue_capacity: default_device_queue_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            drain_timeout_secs: default_drain_timeout(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// Route templates; `{device_id}` is substituted per message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutesSection {
    #[serde(default = "default_device_added_route")]
    pub device_added: String,
    #[serde(default = "default_device_removed_route")]
    pub device_removed: String,
    #[serde(default = "default_device_state_route")]
    pub device_state: String,
    #[serde(default = "default_inventory_route")]
    pub inventory: String,
    #[serde(default = "default_connectivity_route")]
    pub connectivity: String,
    #[serde(default = "default_command_result_route")]
    pub command_result: String,
    #[serde(default = "default_command_routes")]
    pub commands: Vec<CommandRouteConfig>,
}

impl Default for RoutesSection {
    fn default() -> Self {
        Self {
            device_added: default_device_added_route(),
            device_removed: default_device_removed_route(),
            device_state: default_device_state_route(),
            inventory: default_inventory_route(),
            connectivity: default_connectivity_route(),
            command_result: default_command_result_route(),
            commands: default_command_routes(),
        }
    }
}

/// A broker topic carrying commands of one kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRouteConfig {
    pub name: String,
    pub topic: String,
    pub kind: CommandKind,
}

/// Optional privilege drop performed before any connection is opened
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunAsSection {
    #[serde(default)]
    pub enabled: bool,
    pub user: Option<String>,
    pub group: Option<String>,
}

fn default_health_port() -> u16 {
    8080
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_keep_alive() -> u64 {
    60
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_auth_failures() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    10
}

fn default_cloud_timeout() -> u64 {
    10
}

fn default_dispatch_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_device_queue_capacity() -> usize {
    64
}

fn default_subscriber_capacity() -> usize {
    128
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_device_added_route() -> String {
    "fog/devices/{device_id}/registered".to_string()
}

fn default_device_removed_route() -> String {
    "fog/devices/{device_id}/unregistered".to_string()
}

fn default_device_state_route() -> String {
    "fog/devices/{device_id}/state".to_string()
}

fn default_inventory_route() -> String {
    "fog/cloud/inventory".to_string()
}

fn default_connectivity_route() -> String {
    "fog/cloud/connectivity".to_string()
}

fn default_command_result_route() -> String {
    "fog/devices/{device_id}/command-result".to_string()
}

fn default_command_routes() -> Vec<CommandRouteConfig> {
    vec![
        CommandRouteConfig {
            name: "send_command".to_string(),
            topic: "fog/commands/send".to_string(),
            kind: CommandKind::SendCommand,
        },
        CommandRouteConfig {
            name: "update_state".to_string(),
            topic: "fog/commands/state".to_string(),
            kind: CommandKind::UpdateState,
        },
    ]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid gateway ID format: {0}")]
    InvalidGatewayId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported cloud provider: {0}")]
    UnsupportedCloud(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_gateway_id(&self.gateway.id)?;
        validate_broker_url(&self.broker.broker_url)?;

        if self.broker.token_env.is_none() && self.broker.token_file.is_none() {
            return Err(ConfigError::InvalidConfig(
                "broker requires either token_env or token_file".to_string(),
            ));
        }
        if self.broker.token_env.is_some() && self.broker.token_file.is_some() {
            return Err(ConfigError::InvalidConfig(
                "broker token_env and token_file are mutually exclusive".to_string(),
            ));
        }
        if self.broker.buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.buffer_capacity must be greater than 0".to_string(),
            ));
        }

        let reconnect = &self.broker.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms < reconnect.initial_delay_ms
        {
            return Err(ConfigError::InvalidConfig(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.cloud.provider.trim().is_empty() {
            return Err(ConfigError::UnsupportedCloud(String::new()));
        }

        if self.bridge.dispatch_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.dispatch_attempts must be greater than 0".to_string(),
            ));
        }
        if self.bridge.device_queue_capacity == 0 || self.bridge.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge queue capacities must be greater than 0".to_string(),
            ));
        }

        self.routes.validate()?;

        if self.run_as.enabled && (self.run_as.user.is_none() || self.run_as.group.is_none()) {
            return Err(ConfigError::InvalidConfig(
                "run_as requires both user and group when enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get the message token from its environment variable, if configured that way
    pub fn get_broker_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.broker.token_env {
            Some(name) => Self::get_env_var_required(name).map(Some),
            None => Ok(None),
        }
    }

    /// Get the cloud API token from environment variable
    pub fn get_cloud_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.cloud.token_env {
            Some(name) => Self::get_env_var_required(name).map(Some),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[gateway]
id = "test-gateway"

[broker]
broker_url = "mqtt://localhost:1883"
token_env = "FOG_TOKEN"

[cloud]
provider = "http"
base_url = "http://localhost:9000/api"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

impl RoutesSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let templates = [
            ("device_added", &self.device_added),
            ("device_removed", &self.device_removed),
            ("device_state", &self.device_state),
            ("inventory", &self.inventory),
            ("connectivity", &self.connectivity),
            ("command_result", &self.command_result),
        ];
        for (name, template) in templates {
            if template.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "route '{name}' must not be empty"
                )));
            }
        }

        if self.commands.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one command route is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for route in &self.commands {
            if route.topic.contains("{device_id}") {
                return Err(ConfigError::InvalidConfig(format!(
                    "command route '{}' must be a fixed topic",
                    route.name
                )));
            }
            if !seen.insert(canonicalize_topic(&route.topic)) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate command topic '{}'",
                    route.topic
                )));
            }
        }

        Ok(())
    }
}

/// Validate gateway ID format
fn validate_gateway_id(gateway_id: &str) -> Result<(), ConfigError> {
    validate_identifier(gateway_id).map_err(|_| {
        ConfigError::InvalidGatewayId(format!(
            "Gateway ID '{gateway_id}' must match pattern [a-zA-Z0-9._-]+"
        ))
    })
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url =
        Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
    match url.scheme() {
        "mqtt" | "mqtts" if url.host_str().is_some() => Ok(()),
        _ => Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = GatewayConfig::test_config();

        assert_eq!(config.gateway.id, "test-gateway");
        assert_eq!(config.gateway.health_port, 8080);
        assert_eq!(config.broker.buffer_capacity, 256);
        assert_eq!(config.broker.reconnect.max_auth_failures, 3);
        assert_eq!(config.bridge.dispatch_attempts, 3);
        assert_eq!(config.routes.commands.len(), 2);
        assert_eq!(config.routes.commands[0].kind, CommandKind::SendCommand);
        assert!(!config.run_as.enabled);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[gateway]
id = "fog-01"
health_port = 9090

[broker]
broker_url = "mqtts://broker.local:8883"
username_env = "FOG_USER"
password_env = "FOG_PASS"
token_file = "/run/fog/token"
token_ttl_secs = 600
buffer_capacity = 16

[broker.reconnect]
initial_delay_ms = 50
max_delay_ms = 1000
multiplier = 1.5
max_auth_failures = 5

[cloud]
provider = "http"
base_url = "https://cloud.example.com/api"
token_env = "CLOUD_TOKEN"
poll_interval_secs = 5

[bridge]
dispatch_attempts = 5
drain_timeout_secs = 3

[routes]
inventory = "site/a/inventory"

[[routes.commands]]
name = "cmd"
topic = "site/a/commands"
kind = "send_command"

[run_as]
enabled = true
user = "fog"
group = "fog"
"#;

        let config = GatewayConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.gateway.health_port, 9090);
        assert_eq!(config.broker.token_ttl_secs, Some(600));
        assert_eq!(config.broker.reconnect.multiplier, 1.5);
        assert_eq!(config.cloud.poll_interval_secs, 5);
        assert_eq!(config.bridge.dispatch_attempts, 5);
        assert_eq!(config.routes.inventory, "site/a/inventory");
        assert_eq!(config.routes.device_state, "fog/devices/{device_id}/state");
        assert_eq!(config.routes.commands.len(), 1);
        assert!(config.run_as.enabled);
    }

    #[test]
    fn test_invalid_gateway_id() {
        assert!(validate_gateway_id("invalid@gateway").is_err());
        assert!(validate_gateway_id("valid-gateway_123.test").is_ok());
    }

    #[test]
    fn test_broker_url_validation() {
        assert!(validate_broker_url("mqtt://localhost:1883").is_ok());
        assert!(validate_broker_url("mqtts://broker:8883").is_ok());
        assert!(validate_broker_url("http://localhost").is_err());
        assert!(validate_broker_url("not a url").is_err());
    }

    #[test]
    fn test_token_source_required() {
        let toml_content = r#"
[gateway]
id = "fog"

[broker]
broker_url = "mqtt://localhost:1883"

[cloud]
provider = "http"
"#;
        let result = GatewayConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_command_topics_rejected() {
        let mut config = GatewayConfig::test_config();
        config.routes.commands.push(CommandRouteConfig {
            name: "again".to_string(),
            topic: "fog//commands/send/".to_string(),
            kind: CommandKind::UpdateState,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_run_as_requires_user_and_group() {
        let mut config = GatewayConfig::test_config();
        config.run_as = RunAsSection {
            enabled: true,
            user: Some("fog".to_string()),
            group: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_bounds_validated() {
        let mut config = GatewayConfig::test_config();
        config.broker.reconnect.max_delay_ms = 10;
        config.broker.reconnect.initial_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_token_env_var() {
        let mut config = GatewayConfig::test_config();
        config.broker.token_env = Some("FOG_TEST_TOKEN_THAT_IS_NOT_SET".to_string());
        assert!(matches!(
            config.get_broker_token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
