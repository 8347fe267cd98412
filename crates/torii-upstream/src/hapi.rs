//! Generic HTTP FHIR backend.
//!
//! Covers any FHIR server reachable over plain HTTP(S), with optional
//! HTTP Basic credentials. The credential is precomputed at construction
//! so the per-request path is allocation-free.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderValue;
use url::Url;

use torii_core::GatewayError;

use crate::backend::FhirBackend;

/// A generic HTTP FHIR backend.
pub struct HapiBackend {
    base_url: Url,
    basic: Option<HeaderValue>,
}

impl HapiBackend {
    /// Creates a backend without credentials.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            basic: None,
        }
    }

    /// Creates a backend with HTTP Basic credentials.
    pub fn with_basic_auth(
        base_url: Url,
        username: &str,
        password: &str,
    ) -> Result<Self, GatewayError> {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let value = HeaderValue::from_str(&format!("Basic {encoded}"))
            .map_err(|e| GatewayError::internal(format!("Invalid basic credentials: {e}")))?;

        Ok(Self {
            base_url,
            basic: Some(value),
        })
    }
}

#[async_trait]
impl FhirBackend for HapiBackend {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn auth_header(&self) -> Result<Option<HeaderValue>, GatewayError> {
        Ok(self.basic.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unauthenticated_backend() {
        let backend = HapiBackend::new(Url::parse("https://fhir.example.com/fhir").unwrap());
        assert!(backend.auth_header().await.unwrap().is_none());
        assert_eq!(backend.base_url().as_str(), "https://fhir.example.com/fhir");
    }

    #[tokio::test]
    async fn test_basic_credentials_are_encoded() {
        let backend = HapiBackend::with_basic_auth(
            Url::parse("https://fhir.example.com").unwrap(),
            "gateway",
            "s3cret",
        )
        .unwrap();

        let header = backend.auth_header().await.unwrap().unwrap();
        // "gateway:s3cret" in base64.
        assert_eq!(header.to_str().unwrap(), "Basic Z2F0ZXdheTpzM2NyZXQ=");
    }
}
