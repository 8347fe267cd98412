//! Signing key fetching and caching.
//!
//! The verifier resolves token signatures against the issuer's JSON Web
//! Key Set. Keys are fetched lazily on first use and kept until they
//! expire; a token referencing a key id that is not in the cached set
//! forces a refresh, so issuer key rotation is picked up without a
//! restart. Refreshes triggered by unknown key ids are rate-limited so a
//! flood of garbage tokens cannot hammer the issuer.

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the signing key store.
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// How long a fetched key set stays fresh (default: 1 hour).
    pub ttl: Duration,

    /// Minimum interval between refreshes forced by unknown key ids
    /// (default: 30 seconds).
    pub min_refresh_interval: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs. Tests only.
    pub allow_http: bool,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            min_refresh_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            allow_http: false,
        }
    }
}

impl KeyStoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key set TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the minimum interval between forced refreshes.
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Allows HTTP JWKS URIs. Tests only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while fetching or using signing keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// A network error occurred while fetching the key set.
    #[error("Network error: {0}")]
    Network(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The key set could not be parsed.
    #[error("Failed to parse JWKS: {0}")]
    Parse(String),

    /// The requested key id is not in the issuer's key set.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The key set contains no usable signing keys.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The JWKS URI scheme is not allowed.
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,
}

impl From<KeyStoreError> for crate::error::AuthError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::KeyNotFound(kid) => Self::UnknownKey(kid),
            other => Self::KeyDiscovery(other.to_string()),
        }
    }
}

struct CachedKeys {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// Cache of the issuer's signing keys.
pub struct KeyStore {
    http_client: reqwest::Client,
    cache: RwLock<Option<CachedKeys>>,
    config: KeyStoreConfig,
}

impl KeyStore {
    /// Creates a new key store.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(config: KeyStoreConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            cache: RwLock::new(None),
            config,
        }
    }

    /// Gets the decoding key for a key id.
    ///
    /// Checks the cache first; on a miss the key set is refreshed (at most
    /// once per `min_refresh_interval`) before giving up.
    pub async fn key_for(
        &self,
        jwks_uri: &Url,
        kid: &str,
    ) -> Result<(DecodingKey, Option<Algorithm>), KeyStoreError> {
        if let Some(found) = self.cached_key(kid).await {
            tracing::trace!(kid, "JWKS cache hit");
            return Ok(found);
        }

        if self.may_refresh().await {
            tracing::debug!(kid, "JWKS cache miss, refreshing from {jwks_uri}");
            self.refresh(jwks_uri).await?;
        }

        self.cached_key(kid)
            .await
            .ok_or_else(|| KeyStoreError::KeyNotFound(kid.to_string()))
    }

    /// Gets all signing keys, for tokens that do not name a key id.
    ///
    /// Keys marked for encryption use are excluded.
    pub async fn signing_keys(
        &self,
        jwks_uri: &Url,
    ) -> Result<Vec<(DecodingKey, Option<Algorithm>)>, KeyStoreError> {
        self.ensure_fresh(jwks_uri).await?;

        let cache = self.cache.read().await;
        let cached = cache
            .as_ref()
            .ok_or_else(|| KeyStoreError::Network("Cache empty after refresh".to_string()))?;

        let keys: Vec<_> = cached
            .jwks
            .keys
            .iter()
            .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .filter_map(decode_jwk)
            .collect();

        if keys.is_empty() {
            Err(KeyStoreError::NoSigningKeys)
        } else {
            Ok(keys)
        }
    }

    /// Fetches a fresh key set from the endpoint, replacing the cache.
    pub async fn refresh(&self, jwks_uri: &Url) -> Result<(), KeyStoreError> {
        self.validate_scheme(jwks_uri)?;

        let response = self
            .http_client
            .get(jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch JWKS from {jwks_uri}: {e}");
                KeyStoreError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(KeyStoreError::Http(response.status().as_u16()));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| KeyStoreError::Parse(e.to_string()))?;

        tracing::debug!(keys = jwks.keys.len(), "Cached JWKS from {jwks_uri}");

        let mut cache = self.cache.write().await;
        *cache = Some(CachedKeys {
            jwks,
            fetched_at: Instant::now(),
        });

        Ok(())
    }

    async fn cached_key(&self, kid: &str) -> Option<(DecodingKey, Option<Algorithm>)> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;

        if cached.fetched_at.elapsed() >= self.config.ttl {
            return None;
        }

        cached
            .jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))
            .and_then(decode_jwk)
    }

    /// Whether an unknown-kid refresh is allowed right now.
    async fn may_refresh(&self) -> bool {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            None => true,
            Some(cached) => cached.fetched_at.elapsed() >= self.config.min_refresh_interval,
        }
    }

    async fn ensure_fresh(&self, jwks_uri: &Url) -> Result<(), KeyStoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.config.ttl
            {
                return Ok(());
            }
        }
        self.refresh(jwks_uri).await
    }

    fn validate_scheme(&self, uri: &Url) -> Result<(), KeyStoreError> {
        match uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(KeyStoreError::InvalidScheme),
        }
    }
}

/// Converts a JWK into a decoding key plus its advertised algorithm.
fn decode_jwk(jwk: &Jwk) -> Option<(DecodingKey, Option<Algorithm>)> {
    let key = DecodingKey::from_jwk(jwk).ok()?;
    let alg = jwk.common.key_algorithm.and_then(|alg| match alg {
        jsonwebtoken::jwk::KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        jsonwebtoken::jwk::KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        jsonwebtoken::jwk::KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        jsonwebtoken::jwk::KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        jsonwebtoken::jwk::KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        jsonwebtoken::jwk::KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        jsonwebtoken::jwk::KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        jsonwebtoken::jwk::KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        jsonwebtoken::jwk::KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    });
    Some((key, alg))
}
