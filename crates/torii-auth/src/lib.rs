//! Token verification for the Torii FHIR gateway.
//!
//! The gateway trusts an external identity provider: every request carries
//! a bearer JWT signed by that provider, and this crate verifies it. Key
//! material is discovered through the issuer's well-known configuration
//! document and cached; tokens referencing an unknown key id trigger a
//! refresh.
//!
//! The crate also carries the SMART configuration document the gateway
//! synthesizes from the issuer's metadata for unauthenticated discovery.

pub mod discovery;
pub mod error;
pub mod jwks;
pub mod smart;
pub mod verifier;

pub use discovery::{DiscoveryCache, DiscoveryConfig, IssuerMetadata};
pub use error::AuthError;
pub use jwks::{KeyStore, KeyStoreConfig};
pub use smart::SmartConfiguration;
pub use verifier::{TokenVerifier, TokenVerifierConfig, VerifiedToken};
