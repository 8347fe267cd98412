//! Shared application state.

use std::sync::Arc;

use url::Url;

use torii_auth::{DiscoveryCache, TokenVerifier};
use torii_core::CompartmentResolver;
use torii_policy::DecisionPipeline;
use torii_upstream::UpstreamClient;

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Bearer token verifier.
    pub verifier: Arc<TokenVerifier>,

    /// Access decision pipeline.
    pub pipeline: Arc<DecisionPipeline>,

    /// Upstream FHIR client.
    pub upstream: Arc<UpstreamClient>,

    /// Issuer metadata cache, shared with the verifier.
    pub discovery: Arc<DiscoveryCache>,

    /// The issuer URL for discovery lookups.
    pub issuer_url: Url,

    /// Patient compartment resolver.
    pub resolver: CompartmentResolver,
}
