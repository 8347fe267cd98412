//! Gateway error types.
//!
//! This module defines the single error enum shared across the gateway
//! pipeline. Each variant corresponds to one of the externally observable
//! error classes: authentication failures, malformed requests, policy
//! denials, upstream failures, and internal errors.

use std::fmt;

/// Errors that can occur while authorizing and forwarding a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The bearer token is missing, malformed, or failed verification.
    ///
    /// The message is for logs only; clients see a bare 401.
    #[error("Authentication failed: {message}")]
    Unauthenticated {
        /// Description of the verification failure.
        message: String,
    },

    /// The request shape cannot be authorized (forbidden query shape,
    /// resource/type mismatch, disallowed method, malformed bundle).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The access policy denied the request.
    #[error("User is not authorized to {method} {url}")]
    Forbidden {
        /// HTTP method of the denied request.
        method: String,
        /// Request URL (path and query) of the denied request.
        url: String,
    },

    /// The upstream FHIR store could not be reached.
    #[error("Upstream request failed: {message}")]
    Upstream {
        /// Description of the network failure.
        message: String,
    },

    /// The upstream call exceeded its deadline.
    #[error("Upstream request timed out after {seconds} seconds")]
    UpstreamTimeout {
        /// The configured timeout in seconds.
        seconds: u64,
    },

    /// A programming error or misconfiguration.
    ///
    /// Details are logged, never returned to the client.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl GatewayError {
    /// Creates a new `Unauthenticated` error.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error for the given method and URL.
    #[must_use]
    pub fn forbidden(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Forbidden {
            method: method.into(),
            url: url.into(),
        }
    }

    /// Creates a new `Upstream` error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error maps to a 4xx status.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated { .. } | Self::InvalidRequest { .. } | Self::Forbidden { .. }
        )
    }

    /// Returns the error category for logging and monitoring.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthenticated { .. } => ErrorCategory::Authentication,
            Self::InvalidRequest { .. } => ErrorCategory::Validation,
            Self::Forbidden { .. } => ErrorCategory::Authorization,
            Self::Upstream { .. } | Self::UpstreamTimeout { .. } => ErrorCategory::Upstream,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of gateway errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Token verification failures.
    Authentication,
    /// Policy denials.
    Authorization,
    /// Request shape validation failures.
    Validation,
    /// Upstream connectivity failures.
    Upstream,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::Validation => write!(f, "validation"),
            Self::Upstream => write!(f, "upstream"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_message_format() {
        let err = GatewayError::forbidden("GET", "/Patient/3");
        assert_eq!(err.to_string(), "User is not authorized to GET /Patient/3");
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::unauthenticated("signature mismatch");
        assert_eq!(err.to_string(), "Authentication failed: signature mismatch");

        let err = GatewayError::invalid_request("chained parameters are not supported");
        assert_eq!(
            err.to_string(),
            "Invalid request: chained parameters are not supported"
        );

        let err = GatewayError::UpstreamTimeout { seconds: 30 };
        assert_eq!(
            err.to_string(),
            "Upstream request timed out after 30 seconds"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(GatewayError::unauthenticated("x").is_client_error());
        assert!(GatewayError::invalid_request("x").is_client_error());
        assert!(GatewayError::forbidden("GET", "/x").is_client_error());
        assert!(!GatewayError::upstream("x").is_client_error());
        assert!(!GatewayError::internal("x").is_client_error());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            GatewayError::unauthenticated("x").category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            GatewayError::forbidden("GET", "/x").category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            GatewayError::invalid_request("x").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            GatewayError::UpstreamTimeout { seconds: 30 }.category(),
            ErrorCategory::Upstream
        );
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Authentication.to_string(), "authentication");
        assert_eq!(ErrorCategory::Upstream.to_string(), "upstream");
    }
}
