//! The Torii FHIR gateway server.
//!
//! Torii is an HTTP reverse proxy in front of a FHIR store: it verifies
//! bearer tokens from an external identity provider, computes the patient
//! compartment each request touches, runs the access decision pipeline,
//! and forwards approved requests upstream with response URLs rewritten
//! to point back at the gateway.

pub mod config;
pub mod discovery;
pub mod error;
pub mod interceptor;
pub mod server;
pub mod state;

pub use config::{BackendType, GatewayConfig, RunMode};
pub use server::{GatewayServer, build_app, init_tracing};
pub use state::AppState;
