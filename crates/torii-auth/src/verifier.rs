//! Bearer token verification.
//!
//! The [`TokenVerifier`] is the gateway's single authentication point.
//! It accepts the raw `Authorization` header value, insists on the exact
//! `Bearer ` prefix, resolves the signing key through the issuer's
//! well-known configuration, and validates signature, issuer, and expiry.
//! All claims of a verified token are surfaced to the policy layer.
//!
//! In DEV mode the issuer claim is not pinned, so tokens minted by local
//! tooling pass; everything else is still verified.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use url::Url;

use crate::discovery::{DiscoveryCache, DiscoveryConfig, IssuerMetadata};
use crate::error::AuthError;
use crate::jwks::{KeyStore, KeyStoreConfig};

/// The exact prefix a bearer Authorization header must carry.
const BEARER_PREFIX: &str = "Bearer ";

/// Configuration for the token verifier.
#[derive(Debug, Clone)]
pub struct TokenVerifierConfig {
    /// The issuer string matched character-for-character against `iss`.
    pub issuer: String,

    /// Path appended to the issuer URL for metadata discovery.
    pub well_known_path: String,

    /// Whether issuer pinning is relaxed (DEV deployments only).
    pub dev_mode: bool,

    /// Clock skew tolerance for expiry checking (default: 60 seconds).
    pub leeway: Duration,

    /// Whether to allow HTTP issuer URLs. Tests only.
    pub allow_http: bool,
}

impl TokenVerifierConfig {
    /// Creates a configuration for the given issuer.
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            well_known_path: crate::discovery::DEFAULT_WELL_KNOWN_PATH.to_string(),
            dev_mode: false,
            leeway: Duration::from_secs(60),
            allow_http: false,
        }
    }

    /// Sets the well-known discovery path.
    #[must_use]
    pub fn with_well_known_path(mut self, path: impl Into<String>) -> Self {
        self.well_known_path = path.into();
        self
    }

    /// Relaxes issuer pinning (DEV deployments only).
    #[must_use]
    pub fn with_dev_mode(mut self, dev: bool) -> Self {
        self.dev_mode = dev;
        self
    }

    /// Allows HTTP issuer URLs. Tests only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// A verified JWT with its claim set.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    claims: serde_json::Map<String, Value>,
}

impl VerifiedToken {
    /// Wraps a verified claim set.
    #[must_use]
    pub fn new(claims: serde_json::Map<String, Value>) -> Self {
        Self { claims }
    }

    /// All claims of the token.
    #[must_use]
    pub fn claims(&self) -> &serde_json::Map<String, Value> {
        &self.claims
    }

    /// A claim by name.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// A string claim by name.
    #[must_use]
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claim_str("sub")
    }

    /// The `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.claim_str("iss")
    }
}

/// Verifies bearer tokens against the configured issuer.
pub struct TokenVerifier {
    config: TokenVerifierConfig,
    discovery: Arc<DiscoveryCache>,
    keys: Arc<KeyStore>,
}

impl TokenVerifier {
    /// Creates a verifier, wiring up its discovery and key caches.
    #[must_use]
    pub fn new(config: TokenVerifierConfig) -> Self {
        let discovery = DiscoveryCache::new(
            DiscoveryConfig::default()
                .with_well_known_path(config.well_known_path.clone())
                .with_allow_http(config.allow_http),
        );
        let keys = KeyStore::new(KeyStoreConfig::default().with_allow_http(config.allow_http));

        Self {
            config,
            discovery: Arc::new(discovery),
            keys: Arc::new(keys),
        }
    }

    /// Creates a verifier sharing an existing discovery cache.
    ///
    /// The gateway reuses the same cache for the SMART configuration
    /// endpoint, so issuer metadata is fetched once for both purposes.
    #[must_use]
    pub fn with_discovery(config: TokenVerifierConfig, discovery: Arc<DiscoveryCache>) -> Self {
        let keys = KeyStore::new(KeyStoreConfig::default().with_allow_http(config.allow_http));
        Self {
            config,
            discovery,
            keys: Arc::new(keys),
        }
    }

    /// The shared discovery cache.
    #[must_use]
    pub fn discovery(&self) -> Arc<DiscoveryCache> {
        self.discovery.clone()
    }

    /// The configured issuer string.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    /// Verifies the raw `Authorization` header value.
    ///
    /// The header must start with exactly `Bearer ` (case-sensitive)
    /// followed by a non-empty token; anything else is malformed.
    pub async fn verify_bearer(&self, raw_header: &str) -> Result<VerifiedToken, AuthError> {
        let token = raw_header
            .strip_prefix(BEARER_PREFIX)
            .ok_or(AuthError::MalformedHeader)?;

        if token.is_empty() {
            return Err(AuthError::MalformedHeader);
        }

        self.verify(token).await
    }

    /// Verifies a bare token.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Decode(e.to_string()))?;

        if !is_asymmetric(header.alg) {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let issuer_url = Url::parse(&self.config.issuer)
            .map_err(|e| AuthError::KeyDiscovery(format!("Invalid issuer URL: {e}")))?;
        let metadata = self.discovery.get(&issuer_url).await?;

        let candidates = self.candidate_keys(&metadata, header.kid.as_deref()).await?;

        let mut last_error = AuthError::InvalidSignature;
        for (key, key_alg) in candidates {
            let alg = key_alg.unwrap_or(header.alg);
            match decode::<serde_json::Map<String, Value>>(token, &key, &self.validation(alg)) {
                Ok(data) => {
                    tracing::debug!(
                        subject = data.claims.get("sub").and_then(serde_json::Value::as_str),
                        "Verified bearer token"
                    );
                    return Ok(VerifiedToken::new(data.claims));
                }
                Err(e) => last_error = map_jwt_error(&e),
            }
        }

        Err(last_error)
    }

    /// Collects the decoding keys to try for a token.
    async fn candidate_keys(
        &self,
        metadata: &IssuerMetadata,
        kid: Option<&str>,
    ) -> Result<Vec<(DecodingKey, Option<Algorithm>)>, AuthError> {
        if let Some(jwks_uri) = metadata.jwks_uri.as_deref() {
            let uri = Url::parse(jwks_uri)
                .map_err(|e| AuthError::KeyDiscovery(format!("Invalid jwks_uri: {e}")))?;

            return match kid {
                Some(kid) => Ok(vec![self.keys.key_for(&uri, kid).await?]),
                None => Ok(self.keys.signing_keys(&uri).await?),
            };
        }

        // Legacy providers advertise a single PEM public key instead of a
        // key set.
        if let Some(pem) = metadata.public_key.as_deref() {
            let key = DecodingKey::from_rsa_pem(ensure_pem(pem).as_bytes())
                .map_err(|e| AuthError::KeyDiscovery(format!("Invalid public_key: {e}")))?;
            return Ok(vec![(key, None)]);
        }

        Err(AuthError::KeyDiscovery(
            "Issuer metadata has neither jwks_uri nor public_key".to_string(),
        ))
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.config.leeway.as_secs();
        // The gateway does not pin an audience.
        validation.validate_aud = false;

        if self.config.dev_mode {
            validation.iss = None;
        } else {
            validation.set_issuer(&[self.config.issuer.as_str()]);
        }

        validation
    }
}

/// Whether the algorithm is an accepted asymmetric one.
fn is_asymmetric(alg: Algorithm) -> bool {
    !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

/// Wraps a bare base64 key body in PEM armor; already-armored input is
/// passed through.
fn ensure_pem(key: &str) -> String {
    let key = key.trim();
    if key.starts_with("-----BEGIN") {
        return key.to_string();
    }

    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for chunk in key.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}

fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::UnsupportedAlgorithm(err.to_string())
        }
        _ => AuthError::Decode(err.to_string()),
    }
}
