//! Upstream FHIR store clients for the Torii gateway.
//!
//! The gateway talks to exactly one upstream FHIR store. The store is
//! abstracted behind the narrow [`FhirBackend`] trait (base URL plus
//! credentials); the [`UpstreamClient`] does the actual forwarding with
//! header filtering and response URL rewriting.

pub mod backend;
pub mod client;
pub mod gcp;
pub mod hapi;

pub use backend::FhirBackend;
pub use client::{ForwardedResponse, UpstreamClient};
pub use gcp::GcpBackend;
pub use hapi::HapiBackend;
