//! Transaction bundle processing.
//!
//! A FHIR transaction bundle groups several sub-requests into one POST
//! against the gateway root. The processor walks the bundle entries and
//! hands each one to a visitor; the visitor can stop the walk early, which
//! the processor treats as a normal completion.
//!
//! Only `transaction` bundles are accepted. Every entry must carry a
//! `request.method` and `request.url`; anything else is a malformed bundle.

use serde_json::Value;

use crate::error::GatewayError;

/// Whether to keep walking bundle entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleDisposition {
    /// Visit the next entry.
    Continue,
    /// Stop without visiting the remaining entries.
    Stop,
}

/// One entry of a transaction bundle, borrowed from the bundle document.
#[derive(Debug, Clone, Copy)]
pub struct BundleEntry<'a> {
    /// The HTTP method of the sub-request.
    pub method: &'a str,
    /// The sub-request URL, relative to the FHIR base.
    pub url: &'a str,
    /// The entry resource, when present.
    pub resource: Option<&'a Value>,
}

/// Visitor over transaction bundle entries.
pub trait BundleEntryVisitor {
    /// Called once per entry, in bundle order.
    fn visit(&mut self, entry: BundleEntry<'_>) -> Result<BundleDisposition, GatewayError>;
}

/// Walks the entries of a transaction bundle.
pub struct BundleProcessor;

impl BundleProcessor {
    /// Validates the bundle shape and dispatches every entry to the
    /// visitor, stopping early when the visitor asks for it.
    pub fn process(
        bundle: &Value,
        visitor: &mut dyn BundleEntryVisitor,
    ) -> Result<(), GatewayError> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(GatewayError::invalid_request(
                "Request body is not a Bundle",
            ));
        }

        let bundle_type = bundle.get("type").and_then(Value::as_str).unwrap_or("");
        if bundle_type != "transaction" {
            return Err(GatewayError::invalid_request(format!(
                "Only transaction bundles are supported, got '{bundle_type}'"
            )));
        }

        let entries = match bundle.get("entry") {
            None => return Ok(()),
            Some(entries) => entries.as_array().ok_or_else(|| {
                GatewayError::invalid_request("Bundle entry element must be an array")
            })?,
        };

        for (index, entry) in entries.iter().enumerate() {
            let request = entry.get("request").ok_or_else(|| {
                GatewayError::invalid_request(format!("Bundle entry {index} has no request"))
            })?;

            let method = request.get("method").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::invalid_request(format!("Bundle entry {index} has no request.method"))
            })?;

            let url = request.get("url").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::invalid_request(format!("Bundle entry {index} has no request.url"))
            })?;

            let disposition = visitor.visit(BundleEntry {
                method,
                url,
                resource: entry.get("resource"),
            })?;

            if disposition == BundleDisposition::Stop {
                tracing::trace!(visited = index + 1, "Bundle walk stopped early");
                break;
            }
        }

        Ok(())
    }
}
