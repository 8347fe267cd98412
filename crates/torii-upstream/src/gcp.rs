//! Cloud FHIR backend with an OAuth access-token source.
//!
//! The cloud store wants a short-lived OAuth access token on every call.
//! The token source caches the current token and refreshes it ahead of
//! expiry; a single refresher fetches while concurrent readers wait, so
//! the token endpoint sees one request per rotation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::HeaderValue;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use torii_core::GatewayError;

use crate::backend::FhirBackend;

/// Tokens are refreshed at least this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The token endpoint response, in the shape both the cloud metadata
/// server and a standard client-credentials grant produce.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN < self.expires_at
    }
}

/// Fetches and caches OAuth access tokens for the cloud backend.
pub struct AccessTokenSource {
    http_client: reqwest::Client,
    endpoint: Url,
    cached: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl AccessTokenSource {
    /// Creates a source against the given token endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            endpoint,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// The current access token, refreshing it when it is within the
    /// refresh margin of expiry.
    pub async fn token(&self) -> Result<String, GatewayError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref()
                && token.is_fresh()
            {
                return Ok(token.value.clone());
            }
        }

        // One refresher at a time; late arrivals re-check the cache after
        // taking the lock.
        let _guard = self.refresh.lock().await;
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref()
                && token.is_fresh()
            {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!("Refreshing upstream access token from {}", self.endpoint);
        let response = self
            .http_client
            .get(self.endpoint.as_str())
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Token endpoint unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::upstream(format!(
                "Token endpoint returned status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::upstream(format!("Malformed token response: {e}")))?;

        let cached_token = CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        };

        let mut cached = self.cached.write().await;
        *cached = Some(cached_token.clone());

        Ok(cached_token.value)
    }
}

/// A cloud-provider FHIR backend authenticated with OAuth access tokens.
pub struct GcpBackend {
    base_url: Url,
    tokens: AccessTokenSource,
}

impl GcpBackend {
    /// Creates a backend fetching tokens from the given endpoint.
    #[must_use]
    pub fn new(base_url: Url, token_endpoint: Url) -> Self {
        Self {
            base_url,
            tokens: AccessTokenSource::new(token_endpoint),
        }
    }
}

#[async_trait]
impl FhirBackend for GcpBackend {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn auth_header(&self) -> Result<Option<HeaderValue>, GatewayError> {
        let token = self.tokens.token().await?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GatewayError::internal(format!("Invalid access token: {e}")))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token(server: &MockServer, token: &str, expires_in: u64, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": token,
                "expires_in": expires_in,
                "token_type": "Bearer"
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_token_is_cached_while_fresh() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", 3600, 1).await;

        let source = AccessTokenSource::new(format!("{}/token", server.uri()).parse().unwrap());
        assert_eq!(source.token().await.unwrap(), "tok-1");
        assert_eq!(source.token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_token_within_margin_is_refreshed() {
        let server = MockServer::start().await;
        // expires_in below the 60 s margin, so every call refreshes.
        mount_token(&server, "tok-short", 30, 2).await;

        let source = AccessTokenSource::new(format!("{}/token", server.uri()).parse().unwrap());
        assert_eq!(source.token().await.unwrap(), "tok-short");
        assert_eq!(source.token().await.unwrap(), "tok-short");
    }

    #[tokio::test]
    async fn test_token_endpoint_failure_maps_to_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = AccessTokenSource::new(format!("{}/token", server.uri()).parse().unwrap());
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_backend_builds_bearer_header() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-abc", 3600, 1).await;

        let backend = GcpBackend::new(
            "https://healthcare.example.com/v1/fhir".parse().unwrap(),
            format!("{}/token", server.uri()).parse().unwrap(),
        );

        let header = backend.auth_header().await.unwrap().unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer tok-abc");
    }
}
