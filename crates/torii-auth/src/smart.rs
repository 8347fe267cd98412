//! SMART configuration synthesis.
//!
//! The gateway serves `/.well-known/smart-configuration` itself so SMART
//! apps can discover the OAuth endpoints without talking to the identity
//! provider directly. The document is synthesized from the issuer's
//! metadata; fields the issuer does not advertise fall back to the values
//! the SMART App Launch specification requires at minimum.

use serde::Serialize;

use crate::discovery::IssuerMetadata;

/// The SMART configuration document served at
/// `/.well-known/smart-configuration`.
#[derive(Debug, Clone, Serialize)]
pub struct SmartConfiguration {
    /// The identity provider's issuer URL.
    pub issuer: String,

    /// URL of the OAuth authorization endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// URL of the OAuth token endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// URL of the issuer's JSON Web Key Set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Supported grant types.
    pub grant_types_supported: Vec<String>,

    /// Supported response types.
    pub response_types_supported: Vec<String>,

    /// Supported subject identifier types.
    pub subject_types_supported: Vec<String>,

    /// Supported ID token signing algorithms.
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Supported PKCE code challenge methods.
    pub code_challenge_methods_supported: Vec<String>,

    /// SMART capabilities advertised by the gateway.
    pub capabilities: Vec<String>,
}

impl SmartConfiguration {
    /// Builds the document from the issuer's metadata.
    #[must_use]
    pub fn from_metadata(metadata: &IssuerMetadata) -> Self {
        Self {
            issuer: metadata.issuer.clone(),
            authorization_endpoint: metadata.authorization_endpoint.clone(),
            token_endpoint: metadata.token_endpoint.clone(),
            jwks_uri: metadata.jwks_uri.clone(),
            grant_types_supported: metadata
                .grant_types_supported
                .clone()
                .unwrap_or_else(|| vec!["authorization_code".to_string()]),
            response_types_supported: metadata
                .response_types_supported
                .clone()
                .unwrap_or_else(|| vec!["code".to_string()]),
            subject_types_supported: metadata
                .subject_types_supported
                .clone()
                .unwrap_or_else(|| vec!["public".to_string()]),
            id_token_signing_alg_values_supported: metadata
                .id_token_signing_alg_values_supported
                .clone()
                .unwrap_or_else(|| vec!["RS256".to_string()]),
            code_challenge_methods_supported: metadata
                .code_challenge_methods_supported
                .clone()
                .unwrap_or_else(|| vec!["S256".to_string()]),
            capabilities: vec![
                "launch-standalone".to_string(),
                "client-public".to_string(),
                "client-confidential-symmetric".to_string(),
                "context-standalone-patient".to_string(),
                "permission-patient".to_string(),
            ],
        }
    }
}
