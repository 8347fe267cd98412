//! Request forwarding to the upstream FHIR store.
//!
//! The client rewrites the target URL onto the upstream base, filters the
//! request headers down to an allow-list, injects the backend credential,
//! and buffers the response so the upstream base URL can be substituted
//! with the gateway's public base URL. Hypermedia links in responses then
//! point back at the gateway instead of the store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, StatusCode, header};
use serde_json::Value;

use torii_core::{GatewayError, RequestView};

use crate::backend::FhirBackend;

/// Request headers forwarded to the upstream store. Everything else is
/// dropped; `Authorization` is replaced by the backend credential and
/// `Content-Length`/`Host` are set by the HTTP client.
const FORWARDED_REQUEST_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::ACCEPT,
    header::ACCEPT_CHARSET,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    HeaderName::from_static("prefer"),
];

/// Response headers copied back to the client.
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::ETAG,
    header::LOCATION,
    header::LAST_MODIFIED,
];

/// A fully buffered upstream response, URL-rewritten and ready to hand to
/// the client.
#[derive(Debug)]
pub struct ForwardedResponse {
    /// The upstream status, passed through unchanged.
    pub status: StatusCode,
    /// The filtered response headers.
    pub headers: HeaderMap,
    /// The rewritten response body.
    pub body: Bytes,
}

impl ForwardedResponse {
    /// Returns `true` for 2xx upstream statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<Value, GatewayError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| GatewayError::upstream(format!("Upstream body is not valid JSON: {e}")))
    }
}

/// The gateway's client for the upstream FHIR store.
pub struct UpstreamClient {
    http_client: reqwest::Client,
    backend: Arc<dyn FhirBackend>,
    public_base: String,
    upstream_base: String,
    timeout: Duration,
}

impl UpstreamClient {
    /// Creates a client over the given backend.
    ///
    /// `public_base` is the gateway's own externally visible base URL; it
    /// replaces the upstream base in response bodies.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(backend: Arc<dyn FhirBackend>, public_base: &str, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        let upstream_base = backend.base_url().as_str().trim_end_matches('/').to_string();

        Self {
            http_client,
            backend,
            public_base: public_base.trim_end_matches('/').to_string(),
            upstream_base,
            timeout,
        }
    }

    /// The upstream base URL, without a trailing slash.
    #[must_use]
    pub fn upstream_base(&self) -> &str {
        &self.upstream_base
    }

    /// The gateway's public base URL, without a trailing slash.
    #[must_use]
    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    /// Forwards an approved request upstream.
    ///
    /// `extra_query` carries the access decision's request mutation:
    /// parameters that are added to the query, replacing any same-named
    /// parameters of the original request.
    pub async fn forward(
        &self,
        request: &RequestView,
        extra_query: &[(String, String)],
    ) -> Result<ForwardedResponse, GatewayError> {
        let target = self.target_url(request, extra_query);
        tracing::debug!(method = %request.method(), %target, "Forwarding request upstream");

        let mut builder = self
            .http_client
            .request(request.method().clone(), &target)
            .timeout(self.timeout);

        for name in &FORWARDED_REQUEST_HEADERS {
            for value in request.headers().get_all(name) {
                builder = builder.header(name, value);
            }
        }

        if let Some(credential) = self.backend.auth_header().await? {
            builder = builder.header(header::AUTHORIZATION, credential);
        }

        if !request.body_is_empty() {
            builder = builder.body(request.body().clone());
        }

        let response = builder.send().await.map_err(map_send_error(self.timeout))?;
        let status = response.status();

        let mut headers = HeaderMap::new();
        for name in &FORWARDED_RESPONSE_HEADERS {
            for value in response.headers().get_all(name) {
                headers.append(name, value.clone());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(format!("Failed to read upstream body: {e}")))?;

        let body = replace_all(&body, &self.upstream_base, &self.public_base);

        tracing::debug!(status = %status, bytes = body.len(), "Upstream response received");

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }

    /// Issues an authenticated GET against the upstream store and parses
    /// the JSON response. Used by access checkers for lookups.
    pub async fn get_json(&self, path_and_query: &str) -> Result<Value, GatewayError> {
        let target = self.lookup_target(path_and_query);
        let response = self.lookup(&target).await?;

        if !response.status().is_success() {
            return Err(GatewayError::upstream(format!(
                "Upstream lookup {target} returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::upstream(format!("Upstream lookup body invalid: {e}")))
    }

    /// Like [`get_json`](Self::get_json), but a 404 or 410 from the store
    /// yields `None` instead of an error. Used when inspecting resources
    /// that may legitimately not exist.
    pub async fn get_json_optional(
        &self,
        path_and_query: &str,
    ) -> Result<Option<Value>, GatewayError> {
        let target = self.lookup_target(path_and_query);
        let response = self.lookup(&target).await?;

        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::GONE
        ) {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(GatewayError::upstream(format!(
                "Upstream lookup {target} returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| GatewayError::upstream(format!("Upstream lookup body invalid: {e}")))
    }

    fn lookup_target(&self, path_and_query: &str) -> String {
        format!(
            "{}/{}",
            self.upstream_base,
            path_and_query.trim_start_matches('/')
        )
    }

    async fn lookup(&self, target: &str) -> Result<reqwest::Response, GatewayError> {
        let mut builder = self
            .http_client
            .get(target)
            .header(header::ACCEPT, "application/fhir+json")
            .timeout(self.timeout);

        if let Some(credential) = self.backend.auth_header().await? {
            builder = builder.header(header::AUTHORIZATION, credential);
        }

        builder.send().await.map_err(map_send_error(self.timeout))
    }

    /// Issues an authenticated JSON Patch against the upstream store.
    /// Used by post-process hooks that maintain side-effect resources.
    pub async fn patch_json(&self, path: &str, patch: &Value) -> Result<StatusCode, GatewayError> {
        let target = format!("{}/{}", self.upstream_base, path.trim_start_matches('/'));

        let mut builder = self
            .http_client
            .patch(&target)
            .header(header::CONTENT_TYPE, "application/json-patch+json")
            .json(patch)
            .timeout(self.timeout);

        if let Some(credential) = self.backend.auth_header().await? {
            builder = builder.header(header::AUTHORIZATION, credential);
        }

        let response = builder.send().await.map_err(map_send_error(self.timeout))?;
        let status = response.status();

        if !status.is_success() {
            return Err(GatewayError::upstream(format!(
                "Upstream patch {target} returned status {status}"
            )));
        }

        Ok(status)
    }

    /// Builds the upstream target URL with the mutated query string.
    fn target_url(&self, request: &RequestView, extra_query: &[(String, String)]) -> String {
        let mut params: Vec<(&str, &str)> = request
            .query_params()
            .iter()
            .filter(|(k, _)| !extra_query.iter().any(|(ek, _)| ek == k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        params.extend(extra_query.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let path = request.normalized_path();
        let base = &self.upstream_base;

        if params.is_empty() {
            if path.is_empty() {
                base.clone()
            } else {
                format!("{base}/{path}")
            }
        } else {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish();
            format!("{base}/{path}?{query}")
        }
    }
}

/// Maps a reqwest send error onto the gateway's upstream error classes.
fn map_send_error(timeout: Duration) -> impl FnOnce(reqwest::Error) -> GatewayError {
    move |e| {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout {
                seconds: timeout.as_secs(),
            }
        } else {
            GatewayError::upstream(format!("Upstream request failed: {e}"))
        }
    }
}

/// Replaces every occurrence of `from` in `body` with `to`, leaving every
/// other byte untouched.
fn replace_all(body: &[u8], from: &str, to: &str) -> Bytes {
    let from = from.as_bytes();
    let to = to.as_bytes();

    if from.is_empty() || body.len() < from.len() {
        return Bytes::copy_from_slice(body);
    }

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(body[i]);
            i += 1;
        }
    }

    Bytes::from(out)
}
