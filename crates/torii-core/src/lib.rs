//! Core types for the Torii FHIR gateway.
//!
//! This crate contains the pieces of the gateway that do not talk to the
//! network: the error taxonomy, the immutable per-request view, the patient
//! compartment resolver, and the transaction bundle processor. Everything
//! here is pure data manipulation so it can be exercised without a running
//! identity provider or FHIR store.

pub mod bundle;
pub mod compartment;
pub mod error;
pub mod paths;
pub mod request;

pub use bundle::{BundleDisposition, BundleEntry, BundleEntryVisitor, BundleProcessor};
pub use compartment::{CompartmentResolver, PatientCompartment, ResolvedCompartment};
pub use error::GatewayError;
pub use paths::PatientPaths;
pub use request::RequestView;
