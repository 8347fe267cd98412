//! Gateway configuration.
//!
//! All deployment knobs come from environment variables (optionally
//! layered over a `torii.toml` file): `PROXY_TO`, `TOKEN_ISSUER`,
//! `WELL_KNOWN_ENDPOINT`, `BACKEND_TYPE`, `ACCESS_CHECKER`,
//! `ALLOWED_QUERIES_FILE`, `RUN_MODE`, `ACCESS_TOKEN_ENDPOINT`,
//! `BACKEND_USERNAME`/`BACKEND_PASSWORD`, and `PUBLIC_BASE_URL`.
//! Validation failures abort startup; a gateway with a half-working
//! configuration must not serve traffic.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Which kind of upstream FHIR store the gateway forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendType {
    /// A generic HTTP FHIR server, optionally with HTTP Basic credentials.
    #[default]
    Hapi,
    /// A cloud-provider FHIR store authenticated with OAuth access tokens.
    Gcp,
}

/// Deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    /// Production: strict issuer pinning, no permissive checker.
    #[default]
    Prod,
    /// Development: issuer pinning relaxed, permissive checker available.
    Dev,
}

/// The gateway's typed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upstream FHIR base URL (required).
    pub proxy_to: Option<String>,

    /// Issuer URL matched against the token `iss` claim (required).
    pub token_issuer: Option<String>,

    /// Path appended to the issuer for metadata discovery.
    #[serde(default = "default_well_known")]
    pub well_known_endpoint: String,

    /// Which upstream backend to construct.
    #[serde(default)]
    pub backend_type: BackendType,

    /// Name of the access checker to instantiate per request.
    #[serde(default = "default_checker")]
    pub access_checker: String,

    /// Path to the allowed-queries configuration file.
    #[serde(default)]
    pub allowed_queries_file: Option<String>,

    /// PROD or DEV.
    #[serde(default)]
    pub run_mode: RunMode,

    /// Token endpoint for the cloud backend's credentials.
    #[serde(default)]
    pub access_token_endpoint: Option<String>,

    /// HTTP Basic username for the generic backend.
    #[serde(default)]
    pub backend_username: Option<String>,

    /// HTTP Basic password for the generic backend.
    #[serde(default)]
    pub backend_password: Option<String>,

    /// The gateway's externally visible base URL, substituted for the
    /// upstream base in response bodies. Defaults to the listen address.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Listen host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-call upstream timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Allow plain-HTTP issuer and upstream URLs. Tests only.
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_to: None,
            token_issuer: None,
            well_known_endpoint: default_well_known(),
            backend_type: BackendType::default(),
            access_checker: default_checker(),
            allowed_queries_file: None,
            run_mode: RunMode::default(),
            access_token_endpoint: None,
            backend_username: None,
            backend_password: None,
            public_base_url: None,
            host: default_host(),
            port: default_port(),
            upstream_timeout_secs: default_timeout_secs(),
            allow_http: false,
        }
    }
}

fn default_well_known() -> String {
    ".well-known/openid-configuration".to_string()
}

fn default_checker() -> String {
    "list".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    30
}

impl GatewayConfig {
    /// Validates the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        let proxy_to = self
            .proxy_to
            .as_deref()
            .ok_or("PROXY_TO is required: set it to the upstream FHIR base URL")?;
        Url::parse(proxy_to).map_err(|e| format!("PROXY_TO is not a valid URL: {e}"))?;

        let issuer = self
            .token_issuer
            .as_deref()
            .ok_or("TOKEN_ISSUER is required: set it to the identity provider issuer URL")?;
        Url::parse(issuer).map_err(|e| format!("TOKEN_ISSUER is not a valid URL: {e}"))?;

        if self.access_checker.is_empty() {
            return Err("ACCESS_CHECKER must not be empty".to_string());
        }
        if self.access_checker == "permissive" && self.run_mode != RunMode::Dev {
            return Err(
                "ACCESS_CHECKER=permissive is only permitted when RUN_MODE=DEV".to_string(),
            );
        }

        if let Some(file) = self.allowed_queries_file.as_deref()
            && !Path::new(file).exists()
        {
            return Err(format!("ALLOWED_QUERIES_FILE does not exist: {file}"));
        }

        if self.backend_type == BackendType::Gcp && self.access_token_endpoint.is_none() {
            return Err("BACKEND_TYPE=GCP requires ACCESS_TOKEN_ENDPOINT".to_string());
        }

        if self.backend_username.is_some() != self.backend_password.is_some() {
            return Err(
                "BACKEND_USERNAME and BACKEND_PASSWORD must be set together".to_string(),
            );
        }

        if self.upstream_timeout_secs == 0 {
            return Err("upstream timeout must be > 0".to_string());
        }

        Ok(())
    }

    /// The upstream base URL. Panics if called before `validate`.
    #[must_use]
    pub fn proxy_to_url(&self) -> Url {
        Url::parse(self.proxy_to.as_deref().expect("validated config"))
            .expect("validated config")
    }

    /// The issuer string, verbatim. Panics if called before `validate`.
    #[must_use]
    pub fn issuer(&self) -> &str {
        self.token_issuer.as_deref().expect("validated config")
    }

    /// Whether the deployment runs in DEV mode.
    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.run_mode == RunMode::Dev
    }

    /// The listen address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.port))
    }

    /// The per-call upstream timeout.
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// The gateway's public base URL, falling back to the listen address.
    #[must_use]
    pub fn public_base(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.addr()))
    }
}

pub mod loader {
    use super::GatewayConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Loads the configuration from an optional TOML file layered under
    /// environment variables.
    pub fn load_config(path: Option<&str>) -> Result<GatewayConfig, String> {
        let mut builder = Config::builder();

        let file = PathBuf::from(path.unwrap_or("torii.toml"));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        }

        // Environment variables win over the file, e.g. PROXY_TO=...
        builder = builder.add_source(Environment::default().try_parsing(true));

        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: GatewayConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;

        merged.validate()?;
        Ok(merged)
    }
}
