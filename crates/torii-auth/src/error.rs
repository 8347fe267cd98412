//! Token verification error types.
//!
//! Verification can fail in many ways, but the gateway deliberately
//! collapses all of them into a single authentication failure towards the
//! client: a 401 with no body. The variants here exist so logs can tell
//! the difference.

use torii_core::GatewayError;

/// Errors that can occur while verifying a bearer token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No Authorization header was sent.
    #[error("Missing Authorization header")]
    MissingHeader,

    /// The Authorization header does not carry a `Bearer ` token.
    #[error("Malformed Authorization header")]
    MalformedHeader,

    /// The token could not be decoded as a JWT.
    #[error("Token decoding failed: {0}")]
    Decode(String),

    /// The token signature does not verify against the issuer's keys.
    #[error("Token signature is invalid")]
    InvalidSignature,

    /// The `iss` claim does not match the configured issuer.
    #[error("Token issuer mismatch")]
    WrongIssuer,

    /// The token has expired.
    #[error("Token expired")]
    Expired,

    /// The token uses a signing algorithm the gateway does not accept.
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The issuer's configuration or key set could not be fetched.
    #[error("Key discovery failed: {0}")]
    KeyDiscovery(String),

    /// The token references a key id the issuer does not advertise.
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::unauthenticated(err.to_string())
    }
}
