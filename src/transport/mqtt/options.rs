//! MQTT v5 client options derived from the broker configuration

use crate::config::BrokerSection;
use crate::transport::connection::BrokerError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Largest packet accepted or sent
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build client options for one session attempt
///
/// Every attempt gets a unique client id so a half-closed previous session on
/// the broker cannot collide with the new one.
pub fn configure_mqtt_options(
    gateway_id: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, BrokerError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| BrokerError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(BrokerError::InvalidBrokerUrl(config.broker_url.clone())),
    };
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let client_id = format!("fog-{gateway_id}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSection;

    fn broker_config(url: &str) -> BrokerSection {
        BrokerSection {
            broker_url: url.to_string(),
            username_env: None,
            password_env: None,
            token_env: Some("FOG_TOKEN".to_string()),
            token_file: None,
            token_ttl_secs: None,
            buffer_capacity: 16,
            keep_alive_secs: 30,
            reconnect: ReconnectSection::default(),
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("gw", &broker_config("mqtt://localhost:1884")).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1884));
        assert!(options.client_id().starts_with("fog-gw-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_ports() {
        let plain = configure_mqtt_options("gw", &broker_config("mqtt://broker")).unwrap();
        assert_eq!(plain.broker_address().1, 1883);

        let tls = configure_mqtt_options("gw", &broker_config("mqtts://broker")).unwrap();
        assert_eq!(tls.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["invalid-url", "http://localhost:1883"] {
            assert!(matches!(
                configure_mqtt_options("gw", &broker_config(url)),
                Err(BrokerError::InvalidBrokerUrl(_))
            ));
        }
    }
}
