//! List-backed access checker.
//!
//! The caller's token names a FHIR `List` resource on the upstream store
//! (claim `patient_list`); the checker grants access when every patient
//! the request touches is an item of that list. Typed reads that resolve
//! to no patient from the request alone are escalated: the target
//! resource is fetched from the store and its patient references feed the
//! same membership check.
//!
//! Creating a new patient can never pass a membership check, so it is
//! granted up front with a post-process hook that appends the created
//! patient to the list once the upstream store has accepted it. A PUT to
//! a patient id is probed against the store first: an unknown id is a
//! creation, a known one goes through the membership check like any other
//! request.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, header};
use serde_json::{Value, json};

use torii_auth::VerifiedToken;
use torii_core::{GatewayError, PatientCompartment, RequestView, ResolvedCompartment};
use torii_upstream::{ForwardedResponse, UpstreamClient};

use crate::checker::{
    AccessChecker, AccessCheckerFactory, AccessDecision, CheckerContext, PostProcessHook,
    ensure_supported_request, inspect_upstream_resource,
};

/// The claim naming the caller's patient list.
const PATIENT_LIST_CLAIM: &str = "patient_list";

/// Factory for the list-backed checker, registered as `list`.
pub struct ListAccessCheckerFactory;

impl AccessCheckerFactory for ListAccessCheckerFactory {
    fn name(&self) -> &'static str {
        "list"
    }

    fn create(
        &self,
        token: &VerifiedToken,
        ctx: &CheckerContext,
    ) -> Result<Box<dyn AccessChecker>, GatewayError> {
        let list_id = token
            .claim_str(PATIENT_LIST_CLAIM)
            .ok_or_else(|| {
                GatewayError::unauthenticated(format!(
                    "Token has no {PATIENT_LIST_CLAIM} claim"
                ))
            })?
            .to_string();

        Ok(Box::new(ListAccessChecker {
            list_id,
            upstream: ctx.upstream.clone(),
            resolver: ctx.resolver.clone(),
        }))
    }
}

struct ListAccessChecker {
    list_id: String,
    upstream: Arc<UpstreamClient>,
    resolver: torii_core::CompartmentResolver,
}

#[async_trait]
impl AccessChecker for ListAccessChecker {
    async fn check(&self, request: &RequestView) -> Result<AccessDecision, GatewayError> {
        ensure_supported_request(&self.resolver, request)?;

        if request.resource_type() == Some("Patient") {
            if request.method() == Method::POST {
                return Ok(self.grant_new_patient());
            }

            if matches!(request.method(), &Method::PUT | &Method::PATCH)
                && let Some(id) = request.resource_id()
                && !self.patient_exists(id).await?
            {
                return Ok(self.grant_new_patient());
            }
        }

        let compartment = match self.resolver.resolve(request)? {
            ResolvedCompartment::Patients(patients) => patients,
            // A typed read names its patients only inside the stored
            // resource; fetch it and read them off before deciding.
            ResolvedCompartment::Unresolvable { resource_type, id } => {
                inspect_upstream_resource(&self.upstream, &self.resolver, &resource_type, &id)
                    .await?
            }
        };
        if compartment.is_empty() {
            tracing::info!(url = %request.request_url(), "Denied: no patient context");
            return Ok(AccessDecision::deny());
        }

        if self.list_includes_all(&compartment).await? {
            Ok(AccessDecision::grant())
        } else {
            tracing::info!(
                list = %self.list_id,
                patients = compartment.len(),
                "Denied: patients not on list"
            );
            Ok(AccessDecision::deny())
        }
    }
}

impl ListAccessChecker {
    fn grant_new_patient(&self) -> AccessDecision {
        AccessDecision::grant().with_post_process(Box::new(AppendPatientToListHook {
            list_id: self.list_id.clone(),
            upstream: self.upstream.clone(),
        }))
    }

    /// Whether the store already has a patient with this id.
    async fn patient_exists(&self, id: &str) -> Result<bool, GatewayError> {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("_id", id)
            .append_pair("_elements", "id")
            .finish();
        let bundle = self.upstream.get_json(&format!("Patient?{query}")).await?;
        Ok(bundle_has_entries(&bundle))
    }

    /// One search covering the whole compartment: every patient is sent as
    /// its own `item` parameter, so a non-empty result bundle means the
    /// list contains them all.
    async fn list_includes_all(&self, compartment: &PatientCompartment) -> Result<bool, GatewayError> {
        let query = {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            serializer.append_pair("_id", &self.list_id);
            for id in compartment.ids() {
                serializer.append_pair("item", &format!("Patient/{id}"));
            }
            serializer.append_pair("_elements", "id");
            serializer.finish()
        };

        let bundle = self.upstream.get_json(&format!("List?{query}")).await?;
        Ok(bundle_has_entries(&bundle))
    }
}

fn bundle_has_entries(bundle: &Value) -> bool {
    if let Some(entries) = bundle.get("entry").and_then(Value::as_array) {
        return !entries.is_empty();
    }
    bundle.get("total").and_then(Value::as_u64).unwrap_or(0) > 0
}

/// Post-process hook appending a newly created patient to the caller's
/// list.
struct AppendPatientToListHook {
    list_id: String,
    upstream: Arc<UpstreamClient>,
}

#[async_trait]
impl PostProcessHook for AppendPatientToListHook {
    async fn on_response(&self, response: &ForwardedResponse) -> Result<(), GatewayError> {
        if !response.is_success() {
            return Ok(());
        }

        let patient_id = created_patient_id(response).ok_or_else(|| {
            GatewayError::internal(
                "Upstream created a patient but returned no id to append to the list",
            )
        })?;

        let patch = json!([{
            "op": "add",
            "path": "/entry/-",
            "value": {"item": {"reference": format!("Patient/{patient_id}")}}
        }]);

        self.upstream
            .patch_json(&format!("List/{}", self.list_id), &patch)
            .await?;

        tracing::info!(
            list = %self.list_id,
            patient = %patient_id,
            "Appended new patient to list"
        );
        Ok(())
    }
}

/// Pulls the created patient id from the response body, falling back to
/// the Location header.
fn created_patient_id(response: &ForwardedResponse) -> Option<String> {
    if let Ok(body) = response.json()
        && body.get("resourceType").and_then(Value::as_str) == Some("Patient")
        && let Some(id) = body.get("id").and_then(Value::as_str)
    {
        return Some(id.to_string());
    }

    let location = response.headers.get(header::LOCATION)?.to_str().ok()?;
    let mut segments = location.split('/');
    while let Some(segment) = segments.next() {
        if segment == "Patient" {
            return segments.next().map(str::to_string);
        }
    }
    None
}
