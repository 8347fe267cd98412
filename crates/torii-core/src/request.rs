//! Immutable view of an incoming FHIR request.
//!
//! A [`RequestView`] is constructed once per request, after the body has
//! been buffered, and is then shared read-only with the compartment
//! resolver and the access checkers. The body can only be pulled from the
//! HTTP layer once, so the view owns the buffered bytes and every consumer
//! reads from that copy.
//!
//! # Example
//!
//! ```
//! use http::{HeaderMap, Method};
//! use torii_core::RequestView;
//!
//! let view = RequestView::new(
//!     Method::GET,
//!     "/Observation?subject=Patient/123",
//!     HeaderMap::new(),
//!     bytes::Bytes::new(),
//! );
//!
//! assert_eq!(view.resource_type(), Some("Observation"));
//! assert_eq!(view.param_values("subject"), vec!["Patient/123"]);
//! ```

use bytes::Bytes;
use http::{HeaderMap, Method, header};
use serde_json::Value;

use crate::error::GatewayError;

/// Immutable snapshot of one HTTP request against the gateway.
///
/// All accessors borrow from the view; once constructed it is safe to share
/// across threads.
#[derive(Debug, Clone)]
pub struct RequestView {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    raw_query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    charset: String,
}

impl RequestView {
    /// Creates a view from the request parts.
    ///
    /// `path_and_query` is the request target relative to the gateway base,
    /// e.g. `/Observation?subject=Patient/123`. The body must already be
    /// fully buffered.
    #[must_use]
    pub fn new(method: Method, path_and_query: &str, headers: HeaderMap, body: Bytes) -> Self {
        let (path, raw_query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (path_and_query, None),
        };

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let query = raw_query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let charset = charset_from_headers(&headers);

        Self {
            method,
            path,
            query,
            raw_query,
            headers,
            body,
            charset,
        }
    }

    /// The HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path relative to the gateway base, with a leading slash.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path with the leading slash stripped, as used by allowed-query
    /// matching.
    #[must_use]
    pub fn normalized_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Path and query as the client sent them, used in denial messages.
    #[must_use]
    pub fn request_url(&self) -> String {
        match &self.raw_query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// The first path segment, i.e. the FHIR resource type, or `None` for
    /// requests against the gateway root.
    #[must_use]
    pub fn resource_type(&self) -> Option<&str> {
        self.segments().next().filter(|s| !s.is_empty())
    }

    /// The second path segment, i.e. the resource id of a `/Type/id`
    /// request.
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        self.segments().nth(1).filter(|s| !s.is_empty())
    }

    /// Number of non-empty path segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.normalized_path()
            .split('/')
            .filter(|s| !s.is_empty())
    }

    /// All query parameters in request order.
    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// All values of the named query parameter.
    #[must_use]
    pub fn param_values(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns `true` if the named query parameter is present.
    #[must_use]
    pub fn has_param(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }

    /// The distinct query parameter names.
    #[must_use]
    pub fn param_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.query.iter().map(|(k, _)| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// The request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The buffered request body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the body is empty.
    #[must_use]
    pub fn body_is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The effective character set of the body (default UTF-8).
    #[must_use]
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Parses the body as a FHIR JSON resource.
    pub fn resource(&self) -> Result<Value, GatewayError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| GatewayError::invalid_request(format!("Body is not valid JSON: {e}")))
    }
}

/// Extracts the `charset` parameter from the Content-Type header, falling
/// back to UTF-8.
fn charset_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| {
            ct.split(';').skip(1).find_map(|param| {
                let param = param.trim();
                param
                    .strip_prefix("charset=")
                    .map(|cs| cs.trim_matches('"').to_ascii_lowercase())
            })
        })
        .unwrap_or_else(|| "utf-8".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(method: Method, target: &str) -> RequestView {
        RequestView::new(method, target, HeaderMap::new(), Bytes::new())
    }

    #[test]
    fn test_path_splitting() {
        let v = view(Method::GET, "/Patient/75270");
        assert_eq!(v.path(), "/Patient/75270");
        assert_eq!(v.normalized_path(), "Patient/75270");
        assert_eq!(v.resource_type(), Some("Patient"));
        assert_eq!(v.resource_id(), Some("75270"));
        assert_eq!(v.segment_count(), 2);
    }

    #[test]
    fn test_root_request() {
        let v = view(Method::GET, "/?_getpages=ABC-123");
        assert_eq!(v.resource_type(), None);
        assert_eq!(v.resource_id(), None);
        assert_eq!(v.param_values("_getpages"), vec!["ABC-123"]);
    }

    #[test]
    fn test_missing_leading_slash_is_tolerated() {
        let v = view(Method::GET, "Patient/1");
        assert_eq!(v.path(), "/Patient/1");
        assert_eq!(v.resource_type(), Some("Patient"));
    }

    #[test]
    fn test_query_multimap() {
        let v = view(Method::GET, "/Observation?subject=A&subject=B&code=x");
        assert_eq!(v.param_values("subject"), vec!["A", "B"]);
        assert_eq!(v.param_values("code"), vec!["x"]);
        assert!(v.has_param("code"));
        assert!(!v.has_param("category"));
        assert_eq!(v.param_names(), vec!["code", "subject"]);
    }

    #[test]
    fn test_query_url_decoding() {
        let v = view(Method::GET, "/Observation?subject=Patient%2F123");
        assert_eq!(v.param_values("subject"), vec!["Patient/123"]);
    }

    #[test]
    fn test_request_url_keeps_raw_query() {
        let v = view(Method::GET, "/Observation?subject=A&_count=10");
        assert_eq!(v.request_url(), "/Observation?subject=A&_count=10");

        let v = view(Method::GET, "/Patient/3");
        assert_eq!(v.request_url(), "/Patient/3");
    }

    #[test]
    fn test_charset_default_and_override() {
        let v = view(Method::POST, "/Patient");
        assert_eq!(v.charset(), "utf-8");

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/fhir+json; charset=ISO-8859-1".parse().unwrap(),
        );
        let v = RequestView::new(Method::POST, "/Patient", headers, Bytes::new());
        assert_eq!(v.charset(), "iso-8859-1");
    }

    #[test]
    fn test_resource_parsing() {
        let body = Bytes::from_static(br#"{"resourceType":"Patient","id":"1"}"#);
        let v = RequestView::new(Method::PUT, "/Patient/1", HeaderMap::new(), body);
        let resource = v.resource().unwrap();
        assert_eq!(resource["resourceType"], "Patient");

        let bad = RequestView::new(
            Method::PUT,
            "/Patient/1",
            HeaderMap::new(),
            Bytes::from_static(b"not json"),
        );
        assert!(bad.resource().is_err());
    }
}
