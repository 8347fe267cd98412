//! Unauthenticated discovery endpoints.
//!
//! Two routes bypass authentication entirely:
//!
//! - `/.well-known/smart-configuration` is synthesized from the identity
//!   provider's metadata so SMART apps can find the OAuth endpoints;
//! - `/metadata` proxies the upstream CapabilityStatement, patched to
//!   advertise CORS and the OAuth security service with the discovery
//!   endpoints injected.

use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use torii_auth::SmartConfiguration;
use torii_core::GatewayError;

use crate::error::HttpError;
use crate::state::AppState;

/// The SMART extension URL carrying the OAuth endpoints.
const OAUTH_URIS_EXTENSION: &str =
    "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris";

/// `GET /.well-known/smart-configuration`
pub async fn smart_configuration(State(state): State<AppState>) -> Response {
    match build_smart_configuration(&state).await {
        Ok(config) => Json(config).into_response(),
        Err(err) => HttpError(err).into_response(),
    }
}

async fn build_smart_configuration(state: &AppState) -> Result<SmartConfiguration, GatewayError> {
    let metadata = state
        .discovery
        .get(&state.issuer_url)
        .await
        .map_err(|e| GatewayError::upstream(format!("Issuer metadata unavailable: {e}")))?;

    Ok(SmartConfiguration::from_metadata(&metadata))
}

/// `GET /metadata`
pub async fn capability_statement(State(state): State<AppState>) -> Response {
    match build_capability_statement(&state).await {
        Ok(capability) => (
            [(header::CONTENT_TYPE, "application/fhir+json")],
            capability.to_string(),
        )
            .into_response(),
        Err(err) => HttpError(err).into_response(),
    }
}

async fn build_capability_statement(state: &AppState) -> Result<Value, GatewayError> {
    let mut capability = state.upstream.get_json("metadata").await?;

    // The OAuth endpoints are best-effort: a capability statement without
    // them is still better than an error when the issuer is unreachable.
    let (authorize, token) = match state.discovery.get(&state.issuer_url).await {
        Ok(metadata) => (
            metadata.authorization_endpoint.clone(),
            metadata.token_endpoint.clone(),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "Issuer metadata unavailable for capability patch");
            (None, None)
        }
    };

    patch_security(&mut capability, authorize.as_deref(), token.as_deref());
    Ok(capability)
}

/// Patches `rest[0].security` with CORS, the OAuth security service, and
/// the SMART oauth-uris extension.
fn patch_security(capability: &mut Value, authorize: Option<&str>, token: Option<&str>) {
    let rest = capability
        .as_object_mut()
        .map(|obj| obj.entry("rest").or_insert_with(|| json!([{}])));
    let Some(rest) = rest else { return };

    if !rest.is_array() || rest.as_array().is_some_and(Vec::is_empty) {
        *rest = json!([{}]);
    }
    let Some(first) = rest.get_mut(0).and_then(Value::as_object_mut) else {
        return;
    };

    let security = first
        .entry("security")
        .or_insert_with(|| json!({}));
    let Some(security) = security.as_object_mut() else {
        return;
    };

    security.insert("cors".to_string(), json!(true));

    let service = security
        .entry("service")
        .or_insert_with(|| json!([]));
    if let Some(services) = service.as_array_mut() {
        services.push(json!({
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/restful-security-service",
                "code": "OAuth",
                "display": "OAuth"
            }]
        }));
    }

    let mut oauth_uris = Vec::new();
    if let Some(authorize) = authorize {
        oauth_uris.push(json!({"url": "authorize", "valueUri": authorize}));
    }
    if let Some(token) = token {
        oauth_uris.push(json!({"url": "token", "valueUri": token}));
    }

    if !oauth_uris.is_empty() {
        let extension = security
            .entry("extension")
            .or_insert_with(|| json!([]));
        if let Some(extensions) = extension.as_array_mut() {
            extensions.push(json!({
                "url": OAUTH_URIS_EXTENSION,
                "extension": oauth_uris
            }));
        }
    }
}

/// `GET /healthz`
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_security_on_plain_capability() {
        let mut capability = json!({
            "resourceType": "CapabilityStatement",
            "rest": [{"mode": "server"}]
        });

        patch_security(
            &mut capability,
            Some("https://auth.example.com/authorize"),
            Some("https://auth.example.com/token"),
        );

        let security = &capability["rest"][0]["security"];
        assert_eq!(security["cors"], true);
        assert_eq!(
            security["service"][0]["coding"][0]["code"],
            "OAuth"
        );
        assert_eq!(security["extension"][0]["url"], OAUTH_URIS_EXTENSION);
        assert_eq!(
            security["extension"][0]["extension"][0]["valueUri"],
            "https://auth.example.com/authorize"
        );
        assert_eq!(
            security["extension"][0]["extension"][1]["valueUri"],
            "https://auth.example.com/token"
        );
    }

    #[test]
    fn test_patch_security_preserves_existing_services() {
        let mut capability = json!({
            "resourceType": "CapabilityStatement",
            "rest": [{
                "mode": "server",
                "security": {
                    "service": [{"coding": [{"code": "Basic"}]}]
                }
            }]
        });

        patch_security(&mut capability, None, None);

        let services = capability["rest"][0]["security"]["service"]
            .as_array()
            .unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0]["coding"][0]["code"], "Basic");
        assert_eq!(services[1]["coding"][0]["code"], "OAuth");
        // Without endpoints there is no oauth-uris extension.
        assert!(capability["rest"][0]["security"].get("extension").is_none());
    }

    #[test]
    fn test_patch_security_creates_missing_rest() {
        let mut capability = json!({"resourceType": "CapabilityStatement"});
        patch_security(&mut capability, None, Some("https://auth.example.com/token"));
        assert_eq!(capability["rest"][0]["security"]["cors"], true);
    }
}
