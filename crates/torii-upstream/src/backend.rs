//! The upstream backend abstraction.

use async_trait::async_trait;
use http::HeaderValue;
use url::Url;

use torii_core::GatewayError;

/// An upstream FHIR store the gateway forwards to.
///
/// Implementations supply the store's base URL and whatever credential the
/// store wants on each request. Backends are shared across workers and
/// must be thread-safe; credential refresh happens behind the trait.
#[async_trait]
pub trait FhirBackend: Send + Sync {
    /// The base URL of the store, without a trailing slash.
    fn base_url(&self) -> &Url;

    /// The `Authorization` header value for the next upstream call, or
    /// `None` when the store is unauthenticated.
    async fn auth_header(&self) -> Result<Option<HeaderValue>, GatewayError>;
}
