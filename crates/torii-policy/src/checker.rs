//! The access-checker plugin interface.
//!
//! An access checker is a per-request policy object: the registry's
//! factory builds one from the verified token, the orchestrator calls it
//! exactly once, and the resulting [`AccessDecision`] says whether to
//! forward, how to mutate the outgoing query, and what to do after the
//! upstream response has been streamed.
//!
//! Factories are shared across workers and must be thread-safe; the
//! checker instances they return are confined to a single worker, so
//! implementations need no internal synchronization.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use torii_auth::VerifiedToken;
use torii_core::{CompartmentResolver, GatewayError, PatientCompartment, RequestView};
use torii_upstream::{ForwardedResponse, UpstreamClient};

/// Query parameters an access decision adds to the forwarded request,
/// replacing any same-named parameters the client sent.
#[derive(Debug, Clone, Default)]
pub struct RequestMutation {
    /// Parameters to add or replace.
    pub query_params: Vec<(String, String)>,
}

impl RequestMutation {
    /// A mutation adding one parameter.
    #[must_use]
    pub fn set_param(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            query_params: vec![(name.into(), value.into())],
        }
    }
}

/// A continuation executed after a successful upstream forward.
///
/// Hooks see the already-streamed response; their failures are logged and
/// never surfaced to the client. Audit emission belongs here.
#[async_trait]
pub trait PostProcessHook: Send + Sync {
    /// Called exactly once per successful (2xx) upstream forward.
    async fn on_response(&self, response: &ForwardedResponse) -> Result<(), GatewayError>;
}

/// The outcome of an access check.
pub struct AccessDecision {
    granted: bool,
    mutation: Option<RequestMutation>,
    post_process: Option<Box<dyn PostProcessHook>>,
}

impl AccessDecision {
    /// Grants the request.
    #[must_use]
    pub fn grant() -> Self {
        Self {
            granted: true,
            mutation: None,
            post_process: None,
        }
    }

    /// Denies the request.
    #[must_use]
    pub fn deny() -> Self {
        Self {
            granted: false,
            mutation: None,
            post_process: None,
        }
    }

    /// Attaches a request mutation.
    #[must_use]
    pub fn with_mutation(mut self, mutation: RequestMutation) -> Self {
        self.mutation = Some(mutation);
        self
    }

    /// Attaches a post-process hook.
    #[must_use]
    pub fn with_post_process(mut self, hook: Box<dyn PostProcessHook>) -> Self {
        self.post_process = Some(hook);
        self
    }

    /// Whether the request may be forwarded.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// The request mutation, if any.
    #[must_use]
    pub fn mutation(&self) -> Option<&RequestMutation> {
        self.mutation.as_ref()
    }

    /// Takes the post-process hook out of the decision.
    pub fn take_post_process(&mut self) -> Option<Box<dyn PostProcessHook>> {
        self.post_process.take()
    }
}

/// A per-request access policy.
#[async_trait]
pub trait AccessChecker: Send {
    /// Decides whether the request is authorized.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the request shape is
    /// outside what the checker can analyze; a plain policy refusal is a
    /// deny decision, not an error.
    async fn check(&self, request: &RequestView) -> Result<AccessDecision, GatewayError>;
}

/// What checker factories get to work with.
#[derive(Clone)]
pub struct CheckerContext {
    /// Client for upstream lookups (list membership, existence probes).
    pub upstream: Arc<UpstreamClient>,
    /// The compartment resolver.
    pub resolver: CompartmentResolver,
}

/// Builds checker instances; one factory per configured policy, shared
/// across workers.
pub trait AccessCheckerFactory: Send + Sync {
    /// The name the factory is registered under.
    fn name(&self) -> &'static str;

    /// Builds a checker for one request.
    fn create(
        &self,
        token: &VerifiedToken,
        ctx: &CheckerContext,
    ) -> Result<Box<dyn AccessChecker>, GatewayError>;
}

/// The explicit name-to-factory registry.
///
/// Checkers are linked in at build time and enumerated here; there is no
/// classpath scanning or reflection.
#[derive(Default)]
pub struct CheckerRegistry {
    factories: HashMap<&'static str, Arc<dyn AccessCheckerFactory>>,
}

impl CheckerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of built-in checkers. The permissive checker is only
    /// registered for DEV deployments.
    #[must_use]
    pub fn builtin(dev_mode: bool) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::list_checker::ListAccessCheckerFactory));
        registry.register(Arc::new(crate::patient_checker::PatientAccessCheckerFactory));
        if dev_mode {
            registry.register(Arc::new(crate::permissive::PermissiveAccessCheckerFactory));
        }
        registry
    }

    /// Registers a factory under its name.
    pub fn register(&mut self, factory: Arc<dyn AccessCheckerFactory>) {
        tracing::debug!(name = factory.name(), "Registered access checker");
        self.factories.insert(factory.name(), factory);
    }

    /// Returns `true` if a factory is registered under the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds a checker by name for one request.
    pub fn create(
        &self,
        name: &str,
        token: &VerifiedToken,
        ctx: &CheckerContext,
    ) -> Result<Box<dyn AccessChecker>, GatewayError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            GatewayError::internal(format!("No access checker named '{name}' is registered"))
        })?;
        factory.create(token, ctx)
    }
}

/// Resolves the compartment of an escalated read by fetching the target
/// resource from the upstream store and evaluating its patient reference
/// paths.
///
/// This is what "unresolvable at this layer" turns into operationally: a
/// `GET /Type/id` that no query parameter narrows names its patients only
/// inside the stored resource, so the checkers look there before
/// deciding. A resource the store does not have yields the empty set.
pub async fn inspect_upstream_resource(
    upstream: &UpstreamClient,
    resolver: &CompartmentResolver,
    resource_type: &str,
    id: &str,
) -> Result<PatientCompartment, GatewayError> {
    let Some(resource) = upstream
        .get_json_optional(&format!("{resource_type}/{id}"))
        .await?
    else {
        tracing::debug!(resource_type, id, "Escalated read: resource not on upstream");
        return Ok(PatientCompartment::new());
    };

    let compartment: PatientCompartment = resolver
        .paths()
        .patient_ids(resource_type, &resource)
        .into_iter()
        .collect();

    tracing::debug!(
        resource_type,
        id,
        patients = compartment.len(),
        "Escalated read inspected on upstream"
    );
    Ok(compartment)
}

/// Shape guard shared by the built-in checkers: refuses query shapes the
/// compartment analysis cannot cover and resource types outside the
/// patient-paths table.
pub fn ensure_supported_request(
    resolver: &CompartmentResolver,
    request: &RequestView,
) -> Result<(), GatewayError> {
    torii_core::compartment::reject_unsupported_query(request)?;

    if let Some(resource_type) = request.resource_type()
        && !resolver.supports_type(resource_type)
    {
        return Err(GatewayError::invalid_request(format!(
            "Resource type '{resource_type}' is not supported"
        )));
    }

    Ok(())
}
