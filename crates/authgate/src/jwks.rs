//! JWKS fetching and caching
//!
//! - TTL cache, 10 minutes by default
//! - refresh when a token names a `kid` the cache does not have, at most once
//!   per `min_refresh_interval`
//! - HTTPS only, except loopback hosts for development

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// JWKS failures
#[derive(Debug, Error)]
pub enum JwksError {
    /// Endpoint is not HTTPS and not loopback
    #[error("JWKS endpoint must use HTTPS (HTTP only allowed for localhost): {0}")]
    Insecure(String),
    /// Network failure
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),
    /// Non-success status
    #[error("JWKS endpoint returned status {0}")]
    Status(u16),
    /// Body is not a key set
    #[error("invalid JWKS format: {0}")]
    Format(String),
    /// No key with the requested id, even after a refresh
    #[error("key id `{0}` not found in JWKS")]
    UnknownKey(String),
}

#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// Cached client for one JWKS endpoint
#[derive(Debug, Clone)]
pub struct JwksClient {
    jwks_uri: String,
    cache: Arc<RwLock<Option<CachedJwks>>>,
    http_client: reqwest::Client,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    last_refresh: Arc<Mutex<Option<Instant>>>,
}

impl JwksClient {
    /// Create a client with a 10 minute cache and 5 second refresh floor
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::Insecure`] for a non-HTTPS remote endpoint and
    /// [`JwksError::Fetch`] if the HTTP client cannot be built.
    pub fn new(jwks_uri: impl Into<String>) -> Result<Self, JwksError> {
        let jwks_uri = jwks_uri.into();
        let url = Url::parse(&jwks_uri).map_err(|_| JwksError::Insecure(jwks_uri.clone()))?;
        let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
            return Err(JwksError::Insecure(jwks_uri));
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        Ok(Self {
            jwks_uri,
            cache: Arc::new(RwLock::new(None)),
            http_client,
            cache_ttl: Duration::from_secs(600),
            min_refresh_interval: Duration::from_secs(5),
            last_refresh: Arc::new(Mutex::new(None)),
        })
    }

    /// Override the cache TTL
    #[must_use]
    pub fn with_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Override the minimum interval between forced refreshes
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Endpoint URL
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Cached key set, fetched if absent or stale
    ///
    /// # Errors
    ///
    /// Returns an error if a fetch is needed and fails.
    pub async fn get_jwks(&self) -> Result<JwkSet, JwksError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.cache_ttl
            {
                debug!(jwks_uri = %self.jwks_uri, "using cached JWKS");
                return Ok(cached.jwks.clone());
            }
        }
        self.fetch_and_cache().await
    }

    /// Refetch unless the last refresh was too recent
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails.
    pub async fn refresh(&self) -> Result<JwkSet, JwksError> {
        let recent = self
            .last_refresh
            .lock()
            .is_some_and(|last| last.elapsed() < self.min_refresh_interval);
        if recent {
            warn!(jwks_uri = %self.jwks_uri, "JWKS refresh rate limited, using cache");
            return self.get_jwks().await;
        }
        self.fetch_and_cache().await
    }

    /// Key with the given id, refreshing once if it is unknown
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::UnknownKey`] if the key is absent after refresh.
    pub async fn find_key(&self, kid: &str) -> Result<Jwk, JwksError> {
        if let Some(jwk) = self.get_jwks().await?.find(kid) {
            return Ok(jwk.clone());
        }
        debug!(jwks_uri = %self.jwks_uri, kid, "unknown key id, refreshing JWKS");
        self.refresh()
            .await?
            .find(kid)
            .cloned()
            .ok_or_else(|| JwksError::UnknownKey(kid.to_string()))
    }

    async fn fetch_and_cache(&self) -> Result<JwkSet, JwksError> {
        *self.last_refresh.lock() = Some(Instant::now());

        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Status(response.status().as_u16()));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Format(e.to_string()))?;

        info!(jwks_uri = %self.jwks_uri, key_count = jwks.keys.len(), "fetched JWKS");

        *self.cache.write().await = Some(CachedJwks {
            jwks: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }
}
