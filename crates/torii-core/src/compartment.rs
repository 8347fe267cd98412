//! Patient compartment resolution.
//!
//! Every request the gateway authorizes touches the data of zero or more
//! patients. The [`CompartmentResolver`] computes that set from the three
//! shapes a FHIR request can take:
//!
//! - a read or search, where the compartment comes from the path and the
//!   `patient`/`subject` query parameters;
//! - a single-resource write, where it comes from the patient reference
//!   paths of the request body;
//! - a transaction bundle, where it is the union of the per-entry
//!   compartments.
//!
//! Query shapes the resolver cannot analyze are refused outright:
//! `_has` (reverse chaining), `_include`/`_revinclude`, and chained
//! parameters all widen the touched data beyond what the compartment
//! captures, so they map to an invalid-request error rather than a guess.
//! Deletions are refused at this layer as well.

use std::collections::BTreeSet;
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::bundle::{BundleDisposition, BundleEntry, BundleEntryVisitor, BundleProcessor};
use crate::error::GatewayError;
use crate::paths::PatientPaths;
use crate::request::RequestView;

/// The set of patient ids a request touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientCompartment {
    ids: BTreeSet<String>,
}

impl PatientCompartment {
    /// An empty compartment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a patient id.
    pub fn insert(&mut self, id: impl Into<String>) {
        self.ids.insert(id.into());
    }

    /// Merges another compartment into this one.
    pub fn union_with(&mut self, other: PatientCompartment) {
        self.ids.extend(other.ids);
    }

    /// Returns `true` if no patient is referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The number of distinct patients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the given patient is in the compartment.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns `true` if the compartment is exactly `{id}`.
    #[must_use]
    pub fn is_exactly(&self, id: &str) -> bool {
        self.ids.len() == 1 && self.ids.contains(id)
    }

    /// Iterates the patient ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl FromIterator<String> for PatientCompartment {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// The outcome of resolving a request's patient compartment.
///
/// A typed read (`GET /Type/id` with a type other than `Patient`) names no
/// patient in the request itself: unless a `patient`/`subject` parameter
/// narrows it, the patients it touches are only discoverable by fetching
/// the target resource from the upstream store. That case is kept distinct
/// from an empty patient set, which means "no patient context" and leads
/// to denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCompartment {
    /// The patients the request touches, determined from the request
    /// alone.
    Patients(PatientCompartment),

    /// A read whose compartment cannot be determined at this layer; the
    /// access checkers escalate it by inspecting the named resource on
    /// the upstream store.
    Unresolvable {
        /// The resource type of the read.
        resource_type: String,
        /// The resource id of the read.
        id: String,
    },
}

impl ResolvedCompartment {
    /// The resolved patient set, when the request alone determined it.
    #[must_use]
    pub fn patients(&self) -> Option<&PatientCompartment> {
        match self {
            Self::Patients(patients) => Some(patients),
            Self::Unresolvable { .. } => None,
        }
    }

    /// Returns `true` for reads that need upstream inspection.
    #[must_use]
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, Self::Unresolvable { .. })
    }
}

/// Resolves the patient compartment of gateway requests.
#[derive(Debug, Clone)]
pub struct CompartmentResolver {
    paths: Arc<PatientPaths>,
}

impl Default for CompartmentResolver {
    fn default() -> Self {
        Self::new(Arc::new(PatientPaths::standard()))
    }
}

impl CompartmentResolver {
    /// Creates a resolver over the given patient-paths table.
    #[must_use]
    pub fn new(paths: Arc<PatientPaths>) -> Self {
        Self { paths }
    }

    /// The patient-paths table backing this resolver.
    #[must_use]
    pub fn paths(&self) -> &PatientPaths {
        &self.paths
    }

    /// Returns `true` if the resource type appears in the patient-paths
    /// table.
    #[must_use]
    pub fn supports_type(&self, resource_type: &str) -> bool {
        self.paths.supports(resource_type)
    }

    /// Resolves the compartment of a request.
    ///
    /// Three outcomes are possible. Most requests resolve to a patient
    /// set ([`ResolvedCompartment::Patients`]); an empty set there means
    /// the request names no patient (including resource types outside the
    /// patient-paths table), and the access checkers refuse it. A typed
    /// read with no narrowing `patient`/`subject` parameter is
    /// [`ResolvedCompartment::Unresolvable`]: the request alone cannot
    /// name its patients, and the checkers escalate it by inspecting the
    /// target resource on the upstream store.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for deletions, unsupported
    /// query shapes, type mismatches between path and body, `PUT /Patient`
    /// without an id, and malformed bundles.
    pub fn resolve(&self, request: &RequestView) -> Result<ResolvedCompartment, GatewayError> {
        if request.method() == Method::DELETE {
            return Err(GatewayError::invalid_request(
                "Deletions are not authorized through the gateway",
            ));
        }

        reject_unsupported_query(request)?;

        match request.method() {
            &Method::GET | &Method::HEAD => Ok(self.resolve_from_path(request)),
            &Method::POST if request.resource_type().is_none() => {
                Ok(ResolvedCompartment::Patients(self.resolve_bundle(request)?))
            }
            &Method::POST | &Method::PUT | &Method::PATCH => self.resolve_from_body(request),
            other => Err(GatewayError::invalid_request(format!(
                "Method {other} is not supported"
            ))),
        }
    }

    /// Compartment of a read or search: the path id for `/Patient/id`,
    /// plus any `patient`/`subject` query parameter values. A typed read
    /// that none of these narrow is unresolvable at this layer.
    fn resolve_from_path(&self, request: &RequestView) -> ResolvedCompartment {
        let mut compartment = PatientCompartment::new();

        if let (Some("Patient"), Some(id)) = (request.resource_type(), request.resource_id()) {
            compartment.insert(id);
        }

        for name in ["patient", "subject"] {
            for value in request.param_values(name) {
                for item in value.split(',') {
                    if let Some(id) = patient_ref_id(item) {
                        compartment.insert(id);
                    }
                }
            }
        }

        if compartment.is_empty()
            && let (Some(resource_type), Some(id)) = (request.resource_type(), request.resource_id())
            && resource_type != "Patient"
            && self.paths.supports(resource_type)
        {
            return ResolvedCompartment::Unresolvable {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            };
        }

        ResolvedCompartment::Patients(compartment)
    }

    /// Compartment of a single-resource write.
    fn resolve_from_body(&self, request: &RequestView) -> Result<ResolvedCompartment, GatewayError> {
        let resource_type = request
            .resource_type()
            .ok_or_else(|| GatewayError::invalid_request("Write request has no resource type"))?
            .to_string();

        if request.method() == Method::PUT
            && resource_type == "Patient"
            && request.resource_id().is_none()
        {
            return Err(GatewayError::invalid_request(
                "PUT of a Patient requires a resource id",
            ));
        }

        if request.body_is_empty() {
            // PATCH (and bare PUT) without a body fall back to the path.
            return Ok(self.resolve_from_path(request));
        }

        let resource = request.resource()?;

        // A PATCH body may be a JSON Patch array rather than a resource;
        // the compartment then comes from the path alone.
        if request.method() == Method::PATCH && !resource.is_object() {
            return Ok(self.resolve_from_path(request));
        }

        self.resolve_resource(&resource_type, &resource, request.resource_id())
            .map(ResolvedCompartment::Patients)
    }

    /// Compartment of a resource body, shared between single-resource
    /// writes and bundle entries.
    fn resolve_resource(
        &self,
        resource_type: &str,
        resource: &Value,
        path_id: Option<&str>,
    ) -> Result<PatientCompartment, GatewayError> {
        let declared = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if declared != resource_type {
            return Err(GatewayError::invalid_request(format!(
                "Body resource type '{declared}' does not match request path '{resource_type}'"
            )));
        }

        if let (Some(path_id), Some(body_id)) = (path_id, resource.get("id").and_then(Value::as_str))
            && path_id != body_id
        {
            return Err(GatewayError::invalid_request(
                "Resource id does not match the request path",
            ));
        }

        let mut compartment: PatientCompartment = self
            .paths
            .patient_ids(resource_type, resource)
            .into_iter()
            .collect();

        // Writing the Patient resource itself touches that patient.
        if resource_type == "Patient"
            && let Some(id) = path_id
        {
            compartment.insert(id);
        }

        Ok(compartment)
    }

    /// Compartment of a transaction bundle: the union over all entries.
    fn resolve_bundle(&self, request: &RequestView) -> Result<PatientCompartment, GatewayError> {
        let bundle = request.resource()?;

        let mut visitor = CompartmentVisitor {
            resolver: self,
            compartment: PatientCompartment::new(),
        };
        BundleProcessor::process(&bundle, &mut visitor)?;

        Ok(visitor.compartment)
    }
}

/// Bundle visitor accumulating the union compartment.
struct CompartmentVisitor<'a> {
    resolver: &'a CompartmentResolver,
    compartment: PatientCompartment,
}

impl BundleEntryVisitor for CompartmentVisitor<'_> {
    fn visit(&mut self, entry: BundleEntry<'_>) -> Result<BundleDisposition, GatewayError> {
        let method: Method = entry.method.parse().map_err(|_| {
            GatewayError::invalid_request(format!("Bundle entry has unknown method {}", entry.method))
        })?;

        if method == Method::DELETE {
            return Err(GatewayError::invalid_request(
                "Deletions inside bundles are not authorized through the gateway",
            ));
        }

        // Re-parse the entry URL through the request view so path and
        // query handling stay identical to top-level requests.
        let entry_view = RequestView::new(
            method.clone(),
            entry.url,
            http::HeaderMap::new(),
            bytes::Bytes::new(),
        );
        reject_unsupported_query(&entry_view)?;

        match method {
            Method::GET | Method::HEAD => {
                // Inside a bundle there is no escalation path: every read
                // must name its patients in the entry itself.
                match self.resolver.resolve_from_path(&entry_view) {
                    ResolvedCompartment::Patients(part) if !part.is_empty() => {
                        self.compartment.union_with(part);
                    }
                    _ => {
                        return Err(GatewayError::invalid_request(format!(
                            "Bundle GET entry '{}' has no resolvable patient",
                            entry.url
                        )));
                    }
                }
            }
            Method::POST | Method::PUT | Method::PATCH => {
                let resource = entry.resource.ok_or_else(|| {
                    GatewayError::invalid_request(format!(
                        "Bundle {} entry '{}' has no resource",
                        method, entry.url
                    ))
                })?;

                let resource_type = entry_view.resource_type().ok_or_else(|| {
                    GatewayError::invalid_request("Bundle write entry has no resource type")
                })?;

                if method == Method::PUT
                    && resource_type == "Patient"
                    && entry_view.resource_id().is_none()
                {
                    return Err(GatewayError::invalid_request(
                        "PUT of a Patient requires a resource id",
                    ));
                }

                let part = self.resolver.resolve_resource(
                    resource_type,
                    resource,
                    entry_view.resource_id(),
                )?;
                self.compartment.union_with(part);
            }
            other => {
                return Err(GatewayError::invalid_request(format!(
                    "Bundle entry method {other} is not supported"
                )));
            }
        }

        Ok(BundleDisposition::Continue)
    }
}

/// Rejects query shapes the compartment analysis cannot cover.
pub fn reject_unsupported_query(request: &RequestView) -> Result<(), GatewayError> {
    for (name, _) in request.query_params() {
        if name == "_has" || name.starts_with("_has:") {
            return Err(GatewayError::invalid_request(
                "Reverse chaining (_has) is not supported",
            ));
        }

        let stem = name.split(':').next().unwrap_or(name);
        if stem == "_include" || stem == "_revinclude" {
            return Err(GatewayError::invalid_request(format!(
                "{stem} parameters are not supported"
            )));
        }

        if name.contains('.') {
            return Err(GatewayError::invalid_request(format!(
                "Chained search parameter '{name}' is not supported"
            )));
        }
    }

    Ok(())
}

/// Extracts the patient id from a reference value.
///
/// Accepts bare ids and `Patient/`-prefixed relative references; references
/// to other resource types and absolute URLs yield `None`.
fn patient_ref_id(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    match value.split_once('/') {
        None => Some(value),
        Some(("Patient", id)) if !id.is_empty() && !id.contains('/') => Some(id),
        Some(_) => None,
    }
}
