//! Single-patient access checker.
//!
//! The caller's token pins one patient id (claim `patient_id`); the
//! checker grants a request only when its compartment is exactly that
//! patient. Typed reads that name no patient in the request are
//! escalated: the target resource is fetched from the upstream store and
//! its patient references are checked against the pin. Creating patients
//! is never allowed under this policy.

use std::sync::Arc;

use async_trait::async_trait;
use http::Method;

use torii_auth::VerifiedToken;
use torii_core::{CompartmentResolver, GatewayError, RequestView, ResolvedCompartment};
use torii_upstream::UpstreamClient;

use crate::checker::{
    AccessChecker, AccessCheckerFactory, AccessDecision, CheckerContext, ensure_supported_request,
    inspect_upstream_resource,
};

/// The claim pinning the caller to one patient.
const PATIENT_ID_CLAIM: &str = "patient_id";

/// Factory for the single-patient checker, registered as `patient`.
pub struct PatientAccessCheckerFactory;

impl AccessCheckerFactory for PatientAccessCheckerFactory {
    fn name(&self) -> &'static str {
        "patient"
    }

    fn create(
        &self,
        token: &VerifiedToken,
        ctx: &CheckerContext,
    ) -> Result<Box<dyn AccessChecker>, GatewayError> {
        let patient_id = token
            .claim_str(PATIENT_ID_CLAIM)
            .ok_or_else(|| {
                GatewayError::unauthenticated(format!("Token has no {PATIENT_ID_CLAIM} claim"))
            })?
            .to_string();

        Ok(Box::new(PatientAccessChecker {
            patient_id,
            upstream: ctx.upstream.clone(),
            resolver: ctx.resolver.clone(),
        }))
    }
}

struct PatientAccessChecker {
    patient_id: String,
    upstream: Arc<UpstreamClient>,
    resolver: CompartmentResolver,
}

#[async_trait]
impl AccessChecker for PatientAccessChecker {
    async fn check(&self, request: &RequestView) -> Result<AccessDecision, GatewayError> {
        ensure_supported_request(&self.resolver, request)?;

        // Patient creation is disallowed: there is no way a new patient
        // could be the caller's own.
        if request.method() == Method::POST && request.resource_type() == Some("Patient") {
            tracing::info!("Denied: patient creation under single-patient policy");
            return Ok(AccessDecision::deny());
        }

        let compartment = match self.resolver.resolve(request)? {
            ResolvedCompartment::Patients(patients) => patients,
            ResolvedCompartment::Unresolvable { resource_type, id } => {
                inspect_upstream_resource(&self.upstream, &self.resolver, &resource_type, &id)
                    .await?
            }
        };
        if compartment.is_exactly(&self.patient_id) {
            Ok(AccessDecision::grant())
        } else {
            tracing::info!(
                url = %request.request_url(),
                "Denied: request outside the caller's patient compartment"
            );
            Ok(AccessDecision::deny())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::sync::Arc;
    use std::time::Duration;
    use torii_upstream::{HapiBackend, UpstreamClient};
    use url::Url;

    fn checker_at(base_url: &str, patient_id: &str) -> Box<dyn AccessChecker> {
        let claims = serde_json::from_value(serde_json::json!({
            "iss": "https://idp.example.com",
            "patient_id": patient_id,
        }))
        .unwrap();

        let backend = HapiBackend::new(Url::parse(base_url).unwrap());
        let ctx = CheckerContext {
            upstream: Arc::new(UpstreamClient::new(
                Arc::new(backend),
                "https://gateway.example.com",
                Duration::from_secs(5),
            )),
            resolver: CompartmentResolver::default(),
        };

        PatientAccessCheckerFactory
            .create(&VerifiedToken::new(claims), &ctx)
            .unwrap()
    }

    /// For requests that never touch the store; a dead address keeps any
    /// accidental upstream call loud.
    fn checker_for(patient_id: &str) -> Box<dyn AccessChecker> {
        checker_at("http://127.0.0.1:1", patient_id)
    }

    fn get(target: &str) -> RequestView {
        RequestView::new(Method::GET, target, HeaderMap::new(), Bytes::new())
    }

    #[tokio::test]
    async fn test_own_patient_granted() {
        let decision = checker_for("A").check(&get("/Patient/A")).await.unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn test_other_patient_denied() {
        let decision = checker_for("A").check(&get("/Patient/B")).await.unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_search_pinned_to_own_subject() {
        let checker = checker_for("A");

        let decision = checker.check(&get("/Observation?subject=A")).await.unwrap();
        assert!(decision.is_granted());

        let decision = checker.check(&get("/Observation?subject=B")).await.unwrap();
        assert!(!decision.is_granted());

        // Touching a second patient is outside the pin, even when the
        // caller's own patient is among them.
        let decision = checker
            .check(&get("/Observation?subject=A,B"))
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_empty_compartment_denied() {
        let decision = checker_for("A").check(&get("/Observation")).await.unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_typed_read_escalates_to_upstream_inspection() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Observation/obs-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resourceType": "Observation",
                "id": "obs-1",
                "subject": {"reference": "Patient/A"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let granted = checker_at(&server.uri(), "A")
            .check(&get("/Observation/obs-1"))
            .await
            .unwrap();
        assert!(granted.is_granted());

        // The same resource is outside another caller's pin.
        let denied = checker_at(&server.uri(), "B")
            .check(&get("/Observation/obs-1"))
            .await
            .unwrap();
        assert!(!denied.is_granted());
    }

    #[tokio::test]
    async fn test_escalated_read_of_missing_resource_denied() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Observation/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let decision = checker_at(&server.uri(), "A")
            .check(&get("/Observation/nope"))
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_patient_creation_denied() {
        let body = serde_json::json!({"resourceType": "Patient"});
        let request = RequestView::new(
            Method::POST,
            "/Patient",
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        );

        let decision = checker_for("A").check(&request).await.unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_update_own_patient_granted() {
        let body = serde_json::json!({"resourceType": "Patient", "id": "A"});
        let request = RequestView::new(
            Method::PUT,
            "/Patient/A",
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        );

        let decision = checker_for("A").check(&request).await.unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn test_forbidden_query_shape_is_invalid_request_not_deny() {
        let err = match checker_for("A")
            .check(&get("/Observation?subject=A&_include=Observation:patient"))
            .await
        {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_missing_claim_fails_construction() {
        let claims = serde_json::from_value(serde_json::json!({"iss": "x"})).unwrap();
        let backend = HapiBackend::new(Url::parse("http://127.0.0.1:1").unwrap());
        let ctx = CheckerContext {
            upstream: Arc::new(UpstreamClient::new(
                Arc::new(backend),
                "https://gateway.example.com",
                Duration::from_secs(5),
            )),
            resolver: CompartmentResolver::default(),
        };

        let err = match PatientAccessCheckerFactory.create(&VerifiedToken::new(claims), &ctx) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, GatewayError::Unauthenticated { .. }));
    }
}
