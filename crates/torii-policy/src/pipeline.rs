//! The access decision pipeline.
//!
//! Allowed-queries first, checker second: a request matching a configured
//! query shape is granted without constructing the checker at all, so
//! paging links keep working whatever policy is active. An unmatched
//! request gets a fresh checker instance built from the verified token.

use std::sync::Arc;

use torii_auth::VerifiedToken;
use torii_core::{GatewayError, RequestView};

use crate::allowed_queries::AllowedQueries;
use crate::checker::{AccessDecision, CheckerContext, CheckerRegistry};

/// The per-deployment decision pipeline.
pub struct DecisionPipeline {
    allowed: Arc<AllowedQueries>,
    registry: Arc<CheckerRegistry>,
    checker_name: String,
    ctx: CheckerContext,
}

impl DecisionPipeline {
    /// Assembles the pipeline for the configured checker.
    #[must_use]
    pub fn new(
        allowed: Arc<AllowedQueries>,
        registry: Arc<CheckerRegistry>,
        checker_name: impl Into<String>,
        ctx: CheckerContext,
    ) -> Self {
        Self {
            allowed,
            registry,
            checker_name: checker_name.into(),
            ctx,
        }
    }

    /// The name of the configured checker.
    #[must_use]
    pub fn checker_name(&self) -> &str {
        &self.checker_name
    }

    /// Decides whether the request may be forwarded.
    pub async fn decide(
        &self,
        token: &VerifiedToken,
        request: &RequestView,
    ) -> Result<AccessDecision, GatewayError> {
        if self.allowed.matches(request) {
            tracing::debug!(
                url = %request.request_url(),
                "Granted by allowed-queries configuration"
            );
            return Ok(AccessDecision::grant());
        }

        let checker = self.registry.create(&self.checker_name, token, &self.ctx)?;
        checker.check(request).await
    }
}
