//! Connector selection by configured provider

use super::providers::{HttpCloudConfig, HttpCloudConnector};
use super::CloudConnector;
use crate::config::{ConfigError, GatewayConfig};
use std::sync::Arc;
use std::time::Duration;

/// Builds the cloud connector named by `cloud.provider`
pub struct CloudConnectorFactory;

impl CloudConnectorFactory {
    pub fn create(config: &GatewayConfig) -> Result<Arc<dyn CloudConnector>, ConfigError> {
        match config.cloud.provider.as_str() {
            "http" => {
                let http_config = HttpCloudConfig {
                    base_url: config.cloud.base_url.clone(),
                    token: config.get_cloud_token()?,
                    poll_interval: Duration::from_secs(config.cloud.poll_interval_secs),
                    timeout: Duration::from_secs(config.cloud.timeout_secs),
                };
                let connector = HttpCloudConnector::new(http_config)
                    .map_err(|e| ConfigError::InvalidConfig(format!("cloud: {e}")))?;
                Ok(Arc::new(connector))
            }
            provider => Err(ConfigError::UnsupportedCloud(provider.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_http_connector() {
        let config = GatewayConfig::test_config();
        let connector = CloudConnectorFactory::create(&config).unwrap();
        assert_eq!(connector.name(), "http");
        assert!(!connector.is_connected());
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut config = GatewayConfig::test_config();
        config.cloud.provider = "carrier-pigeon".to_string();

        assert!(matches!(
            CloudConnectorFactory::create(&config),
            Err(ConfigError::UnsupportedCloud(p)) if p == "carrier-pigeon"
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = GatewayConfig::test_config();
        config.cloud.base_url = "not a url".to_string();

        assert!(matches!(
            CloudConnectorFactory::create(&config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
