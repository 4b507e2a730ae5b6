//! Message token handling

pub mod token;

pub use token::{
    CachedToken, FileTokenProvider, StaticTokenProvider, Token, TokenCache, TokenError,
    TokenProvider,
};

use crate::config::{ConfigError, GatewayConfig};
use std::sync::Arc;
use std::time::Duration;

/// Token provider selected by the `[broker]` section
///
/// `token_env` gives a static token, `token_file` a file re-read on every
/// refresh.
pub fn token_provider_from_config(
    config: &GatewayConfig,
) -> Result<Arc<dyn TokenProvider>, ConfigError> {
    if let Some(path) = &config.broker.token_file {
        let ttl = config.broker.token_ttl_secs.map(Duration::from_secs);
        return Ok(Arc::new(FileTokenProvider::new(path.clone(), ttl)));
    }

    let value = config
        .get_broker_token()?
        .ok_or_else(|| ConfigError::InvalidConfig("broker token source is required".into()))?;
    let provider = StaticTokenProvider::new(value)
        .map_err(|e| ConfigError::InvalidConfig(format!("broker token: {e}")))?;
    Ok(Arc::new(provider))
}
