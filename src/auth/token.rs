//! Message tokens and the shared token cache
//!
//! Outbound messages carry a short-lived token. [`TokenCache`] hands out the
//! current token and refreshes it on demand; refreshes that overlap in time
//! collapse into a single call to the provider.

use crate::observability::metrics::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Tokens this close to expiry are refreshed before use
const EXPIRY_SKEW: Duration = Duration::from_secs(5);

/// Token loading errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token source unavailable: {0}")]
    Unavailable(String),
    #[error("Token source returned an empty token")]
    Empty,
    #[error("Failed to read token file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A credential with an optional expiry
#[derive(Clone, PartialEq)]
pub struct Token {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Result<Self, TokenError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self { value, expires_at })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Expired, or about to expire
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let skew = chrono::Duration::from_std(EXPIRY_SKEW).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at.is_some_and(|expires| expires - skew <= now)
    }
}

/// Source of fresh tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Token, TokenError>;
}

/// A fixed token read once from configuration
pub struct StaticTokenProvider {
    token: Token,
}

impl StaticTokenProvider {
    pub fn new(value: impl Into<String>) -> Result<Self, TokenError> {
        Ok(Self {
            token: Token::new(value, None)?,
        })
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Token, TokenError> {
        Ok(self.token.clone())
    }
}

/// A token kept in a file that an external agent rotates
///
/// The file is re-read on every refresh. With a TTL the token expires that
/// long after it was read, forcing a proactive re-read.
pub struct FileTokenProvider {
    path: PathBuf,
    ttl: Option<Duration>,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self) -> Result<Token, TokenError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| TokenError::FileRead {
                path: self.path.clone(),
                source,
            })?;
        let expires_at = self
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        Token::new(content.trim(), expires_at)
    }
}

/// Token handed out by the cache, tagged with the generation it came from
#[derive(Clone, PartialEq)]
pub struct CachedToken {
    pub value: String,
    pub generation: u64,
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &"***")
            .field("generation", &self.generation)
            .finish()
    }
}

struct Slot {
    token: Token,
    generation: u64,
}

/// Shared, lazily refreshed token
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    current: RwLock<Option<Slot>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Current token, fetching a new one if none is cached or it expired
    pub async fn current(&self) -> Result<CachedToken, TokenError> {
        {
            let current = self.current.read().await;
            if let Some(slot) = current.as_ref() {
                if !slot.token.is_expired_at(Utc::now()) {
                    return Ok(CachedToken {
                        value: slot.token.value().to_string(),
                        generation: slot.generation,
                    });
                }
            }
        }
        self.refresh(None).await
    }

    /// Replace the token after `stale_generation` was rejected
    ///
    /// Callers that observed the same stale generation share one provider
    /// call: whoever arrives after the refresh gets the new token directly.
    pub async fn refresh(&self, stale_generation: Option<u64>) -> Result<CachedToken, TokenError> {
        let _guard = self.refresh_lock.lock().await;

        {
            let current = self.current.read().await;
            if let Some(slot) = current.as_ref() {
                let superseded = stale_generation.is_some_and(|stale| slot.generation != stale);
                let usable = !slot.token.is_expired_at(Utc::now());
                if usable && (superseded || stale_generation.is_none()) {
                    debug!(generation = slot.generation, "Token already refreshed");
                    return Ok(CachedToken {
                        value: slot.token.value().to_string(),
                        generation: slot.generation,
                    });
                }
            }
        }

        let token = self.provider.fetch().await?;
        let mut current = self.current.write().await;
        let generation = current.as_ref().map_or(1, |slot| slot.generation + 1);
        let cached = CachedToken {
            value: token.value().to_string(),
            generation,
        };
        *current = Some(Slot { token, generation });

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        metrics().token_refreshed();
        info!(provider = self.provider.name(), generation, "Message token refreshed");
        Ok(cached)
    }

    /// Number of provider fetches performed
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}
