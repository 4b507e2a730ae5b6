//! Configuration loading and validation tests
//!
//! Tests focus on the behavior of loading a gateway configuration from disk:
//! defaults applied, cross-field validation and error reporting.

use fog_connector::config::{ConfigError, GatewayConfig};
use fog_connector::protocol::CommandKind;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

const MINIMAL: &str = r#"
[gateway]
id = "fog-gw-1"

[broker]
broker_url = "mqtt://localhost:1883"
token_env = "FOG_TOKEN"

[cloud]
provider = "http"
base_url = "https://cloud.example.com/api"
"#;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let file = write_config(MINIMAL);

    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.gateway.id, "fog-gw-1");
    assert_eq!(config.gateway.health_port, 8080);
    assert_eq!(config.broker.broker_url, "mqtt://localhost:1883");
    assert_eq!(config.cloud.provider, "http");
    assert_eq!(config.bridge.dispatch_attempts, 3);
    assert!(!config.run_as.enabled);
    assert_eq!(config.routes.commands.len(), 2);
}

#[test]
fn test_config_loads_with_custom_routes_and_tuning() {
    let file = write_config(
        r#"
[gateway]
id = "fog-gw-2"
health_port = 9100

[broker]
broker_url = "mqtts://broker.local:8883"
token_file = "/run/fog/token"
token_ttl_secs = 300
buffer_capacity = 32

[broker.reconnect]
initial_delay_ms = 50
max_delay_ms = 5000
max_auth_failures = 5

[cloud]
provider = "http"
base_url = "https://cloud.example.com/api"
poll_interval_secs = 5

[bridge]
dispatch_attempts = 5
drain_timeout_secs = 3

[routes]
inventory = "site-a/inventory"

[[routes.commands]]
name = "commands"
topic = "site-a/commands/+"
kind = "send_command"

[run_as]
enabled = true
user = "fog"
group = "fog"
"#,
    );

    let config = GatewayConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.gateway.health_port, 9100);
    assert_eq!(config.broker.buffer_capacity, 32);
    assert_eq!(config.broker.token_ttl_secs, Some(300));
    assert_eq!(config.broker.reconnect.max_auth_failures, 5);
    assert_eq!(config.bridge.dispatch_attempts, 5);
    assert_eq!(config.routes.inventory, "site-a/inventory");
    assert_eq!(config.routes.commands.len(), 1);
    assert_eq!(config.routes.commands[0].kind, CommandKind::SendCommand);
    assert_eq!(config.run_as.user.as_deref(), Some("fog"));
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = GatewayConfig::load_from_file(std::path::Path::new("/nonexistent/fog.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let file = write_config("[gateway\nid = ");
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_invalid_gateway_id() {
    let file = write_config(&MINIMAL.replace("fog-gw-1", "fog gw/1"));
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidGatewayId(_))));
}

#[test]
fn test_config_rejects_non_mqtt_broker_url() {
    let file = write_config(&MINIMAL.replace("mqtt://localhost:1883", "http://localhost:1883"));
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_config_rejects_zero_dispatch_attempts() {
    let file = write_config(&format!("{MINIMAL}\n[bridge]\ndispatch_attempts = 0\n"));
    let result = GatewayConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = GatewayConfig::from_toml_str(MINIMAL).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = GatewayConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(config, reparsed);
}

#[test]
fn test_shipped_example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("fog-connector.example.toml");

    let config = GatewayConfig::load_from_file(&path).unwrap();

    assert_eq!(config.gateway.id, "fog-site-01");
    assert_eq!(config.routes.commands.len(), 2);
    assert_eq!(config.routes.commands[1].kind, CommandKind::UpdateState);
    assert!(!config.run_as.enabled);
}
