//! The authorization interceptor.
//!
//! Every request that is not a discovery route lands here and walks the
//! per-request pipeline: verify the bearer token, buffer the body into an
//! immutable request view, resolve the patient compartment (surfacing
//! invalid request shapes as 400 before any policy runs), ask the
//! decision pipeline, forward upstream with the decision's query
//! mutation, and finally run the decision's post-process hook once the
//! store has answered with a 2xx. Hook failures are logged and never
//! change the response.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};

use torii_auth::AuthError;
use torii_core::{GatewayError, RequestView};

use crate::error::HttpError;
use crate::state::AppState;

/// Upper bound on buffered request bodies.
const MAX_BODY_BYTES: usize = 10_000_000;

/// The fallback handler for all proxied FHIR requests.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    match process(&state, request).await {
        Ok(response) => response,
        Err(err) => HttpError(err).into_response(),
    }
}

async fn process(state: &AppState, request: Request) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    // VERIFY
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;
    let token = state.verifier.verify_bearer(auth_header).await?;

    // READ: the body can be pulled from the HTTP layer only once; the
    // view buffers it for everyone downstream.
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::invalid_request(format!("Failed to read request body: {e}")))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let view = RequestView::new(
        parts.method.clone(),
        path_and_query,
        parts.headers.clone(),
        body_bytes,
    );

    tracing::debug!(method = %view.method(), url = %view.request_url(), "Authorizing request");

    // COMPARTMENT: invalid request shapes (deletes, chained searches,
    // type mismatches, malformed bundles) stop here with a 400.
    state.resolver.resolve(&view)?;

    // DECIDE
    let mut decision = state.pipeline.decide(&token, &view).await?;
    if !decision.is_granted() {
        return Err(GatewayError::forbidden(
            view.method().as_str(),
            view.request_url(),
        ));
    }

    // FORWARD, with the decision's request mutation applied.
    let extra_query = decision
        .mutation()
        .map(|m| m.query_params.clone())
        .unwrap_or_default();
    let forwarded = state.upstream.forward(&view, &extra_query).await?;

    // POSTPROC: exactly once per successful forward; failures are logged
    // at WARN and never surface (the response is already decided).
    if forwarded.is_success()
        && let Some(hook) = decision.take_post_process()
        && let Err(err) = hook.on_response(&forwarded).await
    {
        tracing::warn!(error = %err, "Post-process hook failed");
    }

    tracing::info!(
        method = %view.method(),
        url = %view.request_url(),
        status = %forwarded.status,
        "Forwarded request"
    );

    // STREAM
    let mut builder = Response::builder().status(forwarded.status);
    for (name, value) in &forwarded.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(forwarded.body))
        .map_err(|e| GatewayError::internal(format!("Failed to build response: {e}")))
}
