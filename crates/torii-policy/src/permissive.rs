//! Allow-all checker for development.
//!
//! Grants every request that carries a valid token. Only registered in
//! DEV deployments; configuration validation refuses it in PROD.

use async_trait::async_trait;

use torii_auth::VerifiedToken;
use torii_core::{GatewayError, RequestView};

use crate::checker::{AccessChecker, AccessCheckerFactory, AccessDecision, CheckerContext};

/// Factory for the permissive checker, registered as `permissive` in DEV
/// mode only.
pub struct PermissiveAccessCheckerFactory;

impl AccessCheckerFactory for PermissiveAccessCheckerFactory {
    fn name(&self) -> &'static str {
        "permissive"
    }

    fn create(
        &self,
        _token: &VerifiedToken,
        _ctx: &CheckerContext,
    ) -> Result<Box<dyn AccessChecker>, GatewayError> {
        Ok(Box::new(PermissiveAccessChecker))
    }
}

struct PermissiveAccessChecker;

#[async_trait]
impl AccessChecker for PermissiveAccessChecker {
    async fn check(&self, request: &RequestView) -> Result<AccessDecision, GatewayError> {
        tracing::debug!(url = %request.request_url(), "Permissive grant");
        Ok(AccessDecision::grant())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::sync::Arc;
    use std::time::Duration;
    use torii_core::CompartmentResolver;
    use torii_upstream::{HapiBackend, UpstreamClient};
    use url::Url;

    #[tokio::test]
    async fn test_grants_everything() {
        let claims = serde_json::from_value(serde_json::json!({"iss": "x"})).unwrap();
        let backend = HapiBackend::new(Url::parse("http://127.0.0.1:1").unwrap());
        let ctx = CheckerContext {
            upstream: Arc::new(UpstreamClient::new(
                Arc::new(backend),
                "https://gateway.example.com",
                Duration::from_secs(5),
            )),
            resolver: CompartmentResolver::default(),
        };

        let checker = PermissiveAccessCheckerFactory
            .create(&VerifiedToken::new(claims), &ctx)
            .unwrap();

        let request = RequestView::new(
            Method::GET,
            "/Device/whatever",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(checker.check(&request).await.unwrap().is_granted());
    }
}
