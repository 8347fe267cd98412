//! Router assembly and the server builder.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use url::Url;

use torii_auth::{TokenVerifier, TokenVerifierConfig};
use torii_core::{CompartmentResolver, GatewayError};
use torii_policy::{AllowedQueries, CheckerContext, CheckerRegistry, DecisionPipeline};
use torii_upstream::{FhirBackend, GcpBackend, HapiBackend, UpstreamClient};

use crate::config::{BackendType, GatewayConfig};
use crate::state::AppState;
use crate::{discovery, interceptor};

/// Initializes the tracing subscriber from `RUST_LOG`, defaulting to
/// `info`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// Builds the axum application from a validated configuration.
///
/// Startup work happens here: the allowed-queries file is loaded, the
/// backend constructed, the checker registry populated. Any failure
/// aborts startup.
pub fn build_app(config: &GatewayConfig) -> Result<Router, GatewayError> {
    let state = build_state(config)?;

    Ok(Router::new()
        .route(
            "/.well-known/smart-configuration",
            get(discovery::smart_configuration),
        )
        .route("/metadata", get(discovery::capability_statement))
        .route("/healthz", get(discovery::health))
        .fallback(interceptor::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn build_state(config: &GatewayConfig) -> Result<AppState, GatewayError> {
    config
        .validate()
        .map_err(GatewayError::internal)?;

    let allowed = match config.allowed_queries_file.as_deref() {
        Some(file) => AllowedQueries::load(std::path::Path::new(file))?,
        None => AllowedQueries::empty(),
    };

    let backend: Arc<dyn FhirBackend> = match config.backend_type {
        BackendType::Hapi => match (&config.backend_username, &config.backend_password) {
            (Some(username), Some(password)) => Arc::new(HapiBackend::with_basic_auth(
                config.proxy_to_url(),
                username,
                password,
            )?),
            _ => Arc::new(HapiBackend::new(config.proxy_to_url())),
        },
        BackendType::Gcp => {
            let endpoint = config
                .access_token_endpoint
                .as_deref()
                .expect("validated config");
            let endpoint = Url::parse(endpoint).map_err(|e| {
                GatewayError::internal(format!("ACCESS_TOKEN_ENDPOINT is not a valid URL: {e}"))
            })?;
            Arc::new(GcpBackend::new(config.proxy_to_url(), endpoint))
        }
    };

    let upstream = Arc::new(UpstreamClient::new(
        backend,
        &config.public_base(),
        config.upstream_timeout(),
    ));

    let verifier = Arc::new(TokenVerifier::new(
        TokenVerifierConfig::new(config.issuer())
            .with_well_known_path(config.well_known_endpoint.clone())
            .with_dev_mode(config.is_dev())
            .with_allow_http(config.allow_http),
    ));

    let resolver = CompartmentResolver::default();

    let registry = Arc::new(CheckerRegistry::builtin(config.is_dev()));
    if !registry.contains(&config.access_checker) {
        return Err(GatewayError::internal(format!(
            "ACCESS_CHECKER names an unknown checker: {}",
            config.access_checker
        )));
    }

    let pipeline = Arc::new(DecisionPipeline::new(
        Arc::new(allowed),
        registry,
        config.access_checker.clone(),
        CheckerContext {
            upstream: upstream.clone(),
            resolver: resolver.clone(),
        },
    ));

    let issuer_url = Url::parse(config.issuer())
        .map_err(|e| GatewayError::internal(format!("TOKEN_ISSUER is not a valid URL: {e}")))?;

    Ok(AppState {
        discovery: verifier.discovery(),
        verifier,
        pipeline,
        upstream,
        issuer_url,
        resolver,
    })
}

/// The configured gateway, ready to serve.
pub struct GatewayServer {
    config: GatewayConfig,
    app: Router,
}

impl GatewayServer {
    /// Builds the server from a configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let app = build_app(&config)?;
        Ok(Self { config, app })
    }

    /// Binds the listen address and serves until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.addr();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            %addr,
            upstream = self.config.proxy_to.as_deref().unwrap_or(""),
            checker = %self.config.access_checker,
            "Torii gateway listening"
        );

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> GatewayConfig {
        GatewayConfig {
            proxy_to: Some("https://fhir.example.com/fhir".to_string()),
            token_issuer: Some("https://auth.example.com/realms/fhir".to_string()),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_build_app_with_minimal_config() {
        build_app(&minimal_config()).unwrap();
    }

    #[test]
    fn test_build_app_rejects_invalid_config() {
        let config = GatewayConfig::default();
        assert!(build_app(&config).is_err());
    }

    #[test]
    fn test_build_app_rejects_unknown_checker() {
        let mut config = minimal_config();
        config.access_checker = "nonexistent".to_string();
        let err = build_app(&config).unwrap_err();
        assert!(err.to_string().contains("unknown checker"));
    }

    #[test]
    fn test_permissive_checker_available_in_dev() {
        let mut config = minimal_config();
        config.access_checker = "permissive".to_string();
        assert!(build_app(&config).is_err());

        config.run_mode = crate::config::RunMode::Dev;
        build_app(&config).unwrap();
    }
}
