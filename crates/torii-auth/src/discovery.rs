//! Issuer metadata discovery and caching.
//!
//! On startup, and whenever a cache entry expires, the gateway fetches the
//! identity provider's well-known configuration document to learn where
//! its signing keys live and which OAuth endpoints it exposes. The path of
//! the document is configurable because some deployments serve it from a
//! non-standard location; the default is the OIDC discovery path.
//!
//! # Security Considerations
//!
//! - Only HTTPS issuer URLs are accepted unless `allow_http` is enabled
//!   (tests only).
//! - Responses are size-limited and fetched with a timeout.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// The default well-known path, per OIDC Discovery.
pub const DEFAULT_WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

/// Configuration for issuer metadata discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Path appended to the issuer URL to locate the metadata document.
    pub well_known_path: String,

    /// Time-to-live for the cached document (default: 1 hour).
    pub ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) issuer URLs. Tests only.
    pub allow_http: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            well_known_path: DEFAULT_WELL_KNOWN_PATH.to_string(),
            ttl: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl DiscoveryConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the well-known path appended to the issuer URL.
    #[must_use]
    pub fn with_well_known_path(mut self, path: impl Into<String>) -> Self {
        self.well_known_path = path.into();
        self
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allows HTTP issuer URLs. Tests only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur during issuer metadata discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching the document.
    #[error("Network error: {0}")]
    Network(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The document could not be parsed as JSON.
    #[error("Failed to parse issuer metadata: {0}")]
    Parse(String),

    /// The issuer URL scheme is not allowed.
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },
}

impl From<DiscoveryError> for crate::error::AuthError {
    fn from(err: DiscoveryError) -> Self {
        Self::KeyDiscovery(err.to_string())
    }
}

/// The issuer's well-known configuration document.
///
/// Only the attributes the gateway consumes are modeled; everything is
/// optional except the issuer itself so that minimal and legacy providers
/// still parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerMetadata {
    /// The issuer identifier.
    pub issuer: String,

    /// URL of the OAuth authorization endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// URL of the OAuth token endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// URL of the JSON Web Key Set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Legacy single public key (PEM body without headers), served by
    /// providers that predate JWKS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Supported grant types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    /// Supported response types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_types_supported: Option<Vec<String>>,

    /// Supported subject identifier types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_types_supported: Option<Vec<String>>,

    /// Supported ID token signing algorithms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token_signing_alg_values_supported: Option<Vec<String>>,

    /// Supported PKCE code challenge methods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
}

struct CachedMetadata {
    metadata: IssuerMetadata,
    fetched_at: Instant,
}

/// Fetches and caches the issuer's metadata document.
pub struct DiscoveryCache {
    http_client: reqwest::Client,
    cache: RwLock<Option<CachedMetadata>>,
    config: DiscoveryConfig,
}

impl DiscoveryCache {
    /// Creates a new discovery cache.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
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

    /// Gets the issuer metadata, fetching it if the cache is cold or
    /// expired.
    pub async fn get(&self, issuer: &Url) -> Result<IssuerMetadata, DiscoveryError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.config.ttl
            {
                tracing::trace!("Issuer metadata cache hit for {issuer}");
                return Ok(cached.metadata.clone());
            }
        }

        self.refresh(issuer).await
    }

    /// Fetches a fresh metadata document and replaces the cached one.
    pub async fn refresh(&self, issuer: &Url) -> Result<IssuerMetadata, DiscoveryError> {
        self.validate_scheme(issuer)?;

        let discovery_url = self.discovery_url(issuer);
        tracing::debug!("Fetching issuer metadata from {discovery_url}");

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch issuer metadata from {discovery_url}: {e}");
                DiscoveryError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Http(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let metadata: IssuerMetadata = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        let mut cache = self.cache.write().await;
        *cache = Some(CachedMetadata {
            metadata: metadata.clone(),
            fetched_at: Instant::now(),
        });

        Ok(metadata)
    }

    /// Drops the cached document so the next `get` fetches fresh.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    /// Builds the discovery URL from the issuer and the configured path.
    fn discovery_url(&self, issuer: &Url) -> Url {
        let mut url = issuer.clone();
        let base = issuer.path().trim_end_matches('/');
        let path = self.config.well_known_path.trim_start_matches('/');
        url.set_path(&format!("{base}/{path}"));
        url
    }

    fn validate_scheme(&self, issuer: &Url) -> Result<(), DiscoveryError> {
        match issuer.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}
