//! Allowed-queries configuration and matching.
//!
//! Deployments can declare literal query shapes that are always permitted
//! without consulting the access checker, typically paging requests
//! (`?_getpages=...`) and other server-generated links a client must be
//! able to follow. The configuration is an ordered list; the first
//! matching entry grants. A request that matches nothing is *deferred* to
//! the checker, never denied here.
//!
//! # Configuration format
//!
//! ```json
//! {
//!   "entries": [
//!     {
//!       "path": "",
//!       "methodType": "GET",
//!       "queryParams": {"_getpages": "ANY_VALUE"},
//!       "allowExtraParams": true,
//!       "allParamsRequired": true
//!     }
//!   ]
//! }
//! ```
//!
//! A `path` ending in `/` is a path-variable slot: the request path must
//! extend it by exactly one segment (`Binary/` matches `Binary/xyz` but
//! neither `Binary` nor `Binary/x/y`). The value `ANY_VALUE` matches any
//! single occurrence of the parameter.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use torii_core::{GatewayError, RequestView};

/// The wildcard parameter value.
pub const ANY_VALUE: &str = "ANY_VALUE";

/// The on-disk configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AllowedQueriesConfig {
    /// The ordered entry list.
    pub entries: Vec<AllowedQueryEntry>,
}

/// One configured query shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedQueryEntry {
    /// The literal path, `""` for the root; `None` is a configuration
    /// error.
    pub path: Option<String>,

    /// Optional HTTP method restriction.
    #[serde(default)]
    pub method_type: Option<String>,

    /// Required query parameters: name to literal value or `ANY_VALUE`.
    #[serde(default)]
    pub query_params: HashMap<String, String>,

    /// Whether parameters beyond `query_params` are permitted.
    #[serde(default)]
    pub allow_extra_params: bool,

    /// Whether every listed parameter must appear in the request.
    #[serde(default = "default_true")]
    pub all_params_required: bool,
}

fn default_true() -> bool {
    true
}

/// The validated, immutable allowed-queries matcher.
#[derive(Debug, Clone, Default)]
pub struct AllowedQueries {
    entries: Vec<CompiledEntry>,
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    path: String,
    method: Option<String>,
    query_params: HashMap<String, String>,
    allow_extra_params: bool,
    all_params_required: bool,
}

impl AllowedQueries {
    /// An empty matcher that defers everything to the checker.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validates and compiles a parsed configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry has no path; the gateway refuses to
    /// start on a malformed file.
    pub fn from_config(config: AllowedQueriesConfig) -> Result<Self, GatewayError> {
        let mut entries = Vec::with_capacity(config.entries.len());

        for (index, entry) in config.entries.into_iter().enumerate() {
            let path = entry.path.ok_or_else(|| {
                GatewayError::internal(format!(
                    "Allowed-queries entry {index} has no path"
                ))
            })?;

            entries.push(CompiledEntry {
                path: path.trim_start_matches('/').to_string(),
                method: entry.method_type,
                query_params: entry.query_params,
                allow_extra_params: entry.allow_extra_params,
                all_params_required: entry.all_params_required,
            });
        }

        Ok(Self { entries })
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::internal(format!(
                "Cannot read allowed-queries file {}: {e}",
                path.display()
            ))
        })?;

        let config: AllowedQueriesConfig = serde_json::from_str(&content).map_err(|e| {
            GatewayError::internal(format!(
                "Malformed allowed-queries file {}: {e}",
                path.display()
            ))
        })?;

        let compiled = Self::from_config(config)?;
        tracing::info!(
            entries = compiled.entries.len(),
            file = %path.display(),
            "Loaded allowed-queries configuration"
        );
        Ok(compiled)
    }

    /// The number of configured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if any entry matches the request; first match wins.
    #[must_use]
    pub fn matches(&self, request: &RequestView) -> bool {
        self.entries.iter().any(|e| e.matches(request))
    }
}

impl CompiledEntry {
    fn matches(&self, request: &RequestView) -> bool {
        if let Some(method) = &self.method
            && method != request.method().as_str()
        {
            return false;
        }

        if !self.path_matches(request.normalized_path()) {
            return false;
        }

        let mut matched: HashSet<&str> = HashSet::new();
        for (name, expected) in &self.query_params {
            let values = request.param_values(name);

            if values.is_empty() {
                if self.all_params_required {
                    return false;
                }
                continue;
            }

            let ok = if expected == ANY_VALUE {
                values.len() == 1
            } else {
                values.iter().all(|v| v == expected)
            };
            if !ok {
                return false;
            }

            matched.insert(name.as_str());
        }

        if !self.allow_extra_params {
            let extra = request
                .param_names()
                .into_iter()
                .any(|name| !matched.contains(name));
            if extra {
                return false;
            }
        }

        true
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if let Some(prefix) = self.path.strip_suffix('/') {
            // Path-variable slot: prefix plus exactly one extra segment.
            let Some(rest) = request_path.strip_prefix(prefix) else {
                return false;
            };
            let Some(segment) = rest.strip_prefix('/') else {
                return false;
            };
            !segment.is_empty() && !segment.contains('/')
        } else {
            request_path == self.path
        }
    }
}
