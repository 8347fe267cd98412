//! Gateway error to HTTP response mapping.
//!
//! - authentication failures become a bare 401 (no detail leaks to
//!   unauthenticated callers; the reason goes to the log),
//! - invalid requests become a 400 with a short message,
//! - policy denials become a 403 whose body is exactly
//!   `User is not authorized to {METHOD} {URL}`,
//! - upstream failures become 502, timeouts 504,
//! - everything else is a 500 with the detail logged, not returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use torii_core::GatewayError;

/// Newtype so the axum `IntoResponse` impl can live in this crate.
pub struct HttpError(pub GatewayError);

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self.0 {
            GatewayError::Unauthenticated { message } => {
                tracing::info!(reason = %message, "Request rejected: authentication failed");
                StatusCode::UNAUTHORIZED.into_response()
            }
            err @ GatewayError::Forbidden { .. } => {
                let body = err.to_string();
                tracing::info!("{body}");
                (StatusCode::FORBIDDEN, body).into_response()
            }
            GatewayError::InvalidRequest { message } => {
                tracing::info!(reason = %message, "Request rejected: invalid request");
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            GatewayError::Upstream { message } => {
                tracing::warn!(reason = %message, "Upstream failure");
                (StatusCode::BAD_GATEWAY, "Upstream FHIR store unavailable").into_response()
            }
            GatewayError::UpstreamTimeout { seconds } => {
                tracing::warn!(seconds, "Upstream timeout");
                (StatusCode::GATEWAY_TIMEOUT, "Upstream FHIR store timed out").into_response()
            }
            GatewayError::Internal { message } => {
                tracing::error!(reason = %message, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
