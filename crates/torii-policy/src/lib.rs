//! Access decision pipeline for the Torii FHIR gateway.
//!
//! A request that survives token verification still has to be authorized.
//! The pipeline first consults the static allowed-queries configuration
//! (literal query shapes that are always permitted, e.g. paging links);
//! anything unmatched is handed to the configured access checker, a
//! per-request policy object constructed from the verified token.
//!
//! Checkers are registered by name in an explicit registry at startup;
//! there is no runtime plugin scanning.

pub mod allowed_queries;
pub mod checker;
pub mod list_checker;
pub mod patient_checker;
pub mod permissive;
pub mod pipeline;

pub use allowed_queries::AllowedQueries;
pub use checker::{
    AccessChecker, AccessCheckerFactory, AccessDecision, CheckerContext, CheckerRegistry,
    PostProcessHook, RequestMutation,
};
pub use list_checker::ListAccessCheckerFactory;
pub use patient_checker::PatientAccessCheckerFactory;
pub use permissive::PermissiveAccessCheckerFactory;
pub use pipeline::DecisionPipeline;
