//! Patient reference paths per FHIR resource type.
//!
//! The compartment resolver needs to know, for each resource type, which
//! fields hold references into the Patient compartment. This module carries
//! that table: a map from resource type to a list of dotted paths, each
//! optionally qualified with `.where(resolve() is Patient)` for fields that
//! can reference more than one resource type (for example
//! `Observation.performer`).
//!
//! The built-in table follows the standard Patient compartment definition
//! for the resource types a gateway deployment typically serves. Deployments
//! can replace it with a JSON document of the same shape:
//!
//! ```json
//! {
//!   "Observation": ["subject", "performer.where(resolve() is Patient)"],
//!   "Encounter": ["subject"]
//! }
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::error::GatewayError;

/// One dotted path into a resource, pointing at patient references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePath {
    segments: Vec<String>,
}

impl ReferencePath {
    /// Parses a path expression such as `subject` or
    /// `performer.where(resolve() is Patient)`.
    ///
    /// The `where(resolve() is Patient)` qualifier marks mixed-type
    /// reference fields; collected references are filtered to the Patient
    /// type in either case, so the qualifier is accepted and stripped.
    pub fn parse(expr: &str) -> Result<Self, GatewayError> {
        let expr = expr
            .trim()
            .trim_end_matches(".where(resolve() is Patient)");

        if expr.is_empty() {
            return Err(GatewayError::internal(
                "Empty patient path expression in configuration",
            ));
        }

        let segments: Vec<String> = expr.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(GatewayError::internal(format!(
                "Malformed patient path expression: {expr}"
            )));
        }

        Ok(Self { segments })
    }

    /// Collects all reference strings reachable through this path.
    pub fn collect(&self, resource: &Value, refs: &mut Vec<String>) {
        Self::walk(resource, &self.segments, refs);
    }

    fn walk(value: &Value, segments: &[String], refs: &mut Vec<String>) {
        // Arrays fan out at every level.
        if let Some(arr) = value.as_array() {
            for item in arr {
                Self::walk(item, segments, refs);
            }
            return;
        }

        match segments.split_first() {
            Some((head, rest)) => {
                if let Some(next) = value.get(head) {
                    Self::walk(next, rest, refs);
                }
            }
            None => collect_references(value, refs),
        }
    }
}

/// Collects reference strings from a terminal path value.
///
/// Handles direct strings, `{"reference": "..."}` objects, and arrays of
/// either.
fn collect_references(value: &Value, refs: &mut Vec<String>) {
    if let Some(s) = value.as_str() {
        refs.push(s.to_string());
        return;
    }

    if let Some(r) = value.get("reference").and_then(Value::as_str) {
        refs.push(r.to_string());
        return;
    }

    if let Some(arr) = value.as_array() {
        for item in arr {
            collect_references(item, refs);
        }
    }
}

/// The patient reference paths for every resource type the gateway serves.
#[derive(Debug, Clone)]
pub struct PatientPaths {
    paths: HashMap<String, Vec<ReferencePath>>,
}

impl Default for PatientPaths {
    fn default() -> Self {
        Self::standard()
    }
}

impl PatientPaths {
    /// The built-in table, derived from the standard Patient compartment
    /// definition.
    #[must_use]
    pub fn standard() -> Self {
        let entries: &[(&str, &[&str])] = &[
            ("Patient", &["link.other.where(resolve() is Patient)"]),
            (
                "Observation",
                &["subject", "performer.where(resolve() is Patient)"],
            ),
            (
                "Encounter",
                &[
                    "subject",
                    "participant.individual.where(resolve() is Patient)",
                ],
            ),
            ("Condition", &["subject", "asserter.where(resolve() is Patient)"]),
            (
                "Procedure",
                &["subject", "performer.actor.where(resolve() is Patient)"],
            ),
            ("List", &["subject"]),
            ("MedicationRequest", &["subject"]),
            (
                "DiagnosticReport",
                &["subject", "performer.where(resolve() is Patient)"],
            ),
            ("AllergyIntolerance", &["patient"]),
            ("Immunization", &["patient"]),
            ("CarePlan", &["subject"]),
            ("ServiceRequest", &["subject"]),
            ("DocumentReference", &["subject"]),
            ("Goal", &["subject"]),
            ("FamilyMemberHistory", &["patient"]),
            ("RelatedPerson", &["patient"]),
        ];

        let mut paths = HashMap::new();
        for (resource_type, exprs) in entries {
            let parsed = exprs
                .iter()
                .map(|e| ReferencePath::parse(e).expect("built-in patient path must parse"))
                .collect();
            paths.insert((*resource_type).to_string(), parsed);
        }

        Self { paths }
    }

    /// Loads a table from a JSON document mapping resource types to path
    /// expressions.
    pub fn from_json(doc: &Value) -> Result<Self, GatewayError> {
        let obj = doc.as_object().ok_or_else(|| {
            GatewayError::internal("Patient paths configuration must be a JSON object")
        })?;

        let mut paths = HashMap::new();
        for (resource_type, exprs) in obj {
            let list = exprs.as_array().ok_or_else(|| {
                GatewayError::internal(format!(
                    "Patient paths for {resource_type} must be an array"
                ))
            })?;
            let parsed = list
                .iter()
                .map(|e| {
                    e.as_str()
                        .ok_or_else(|| {
                            GatewayError::internal(format!(
                                "Patient path for {resource_type} must be a string"
                            ))
                        })
                        .and_then(ReferencePath::parse)
                })
                .collect::<Result<Vec<_>, _>>()?;
            paths.insert(resource_type.clone(), parsed);
        }

        Ok(Self { paths })
    }

    /// Returns `true` if the resource type appears in the table.
    #[must_use]
    pub fn supports(&self, resource_type: &str) -> bool {
        self.paths.contains_key(resource_type)
    }

    /// Collects the patient ids referenced by a resource of the given type.
    ///
    /// Only `Patient/`-prefixed references contribute; the prefix is
    /// stripped. Resource types absent from the table yield the empty set.
    #[must_use]
    pub fn patient_ids(&self, resource_type: &str, resource: &Value) -> Vec<String> {
        let Some(paths) = self.paths.get(resource_type) else {
            return Vec::new();
        };

        let mut refs = Vec::new();
        for path in paths {
            path.collect(resource, &mut refs);
        }

        let mut ids: Vec<String> = refs
            .iter()
            .filter_map(|r| r.strip_prefix("Patient/"))
            .map(str::to_string)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_path() {
        let p = ReferencePath::parse("subject").unwrap();
        assert_eq!(p.segments, vec!["subject"]);
    }

    #[test]
    fn test_parse_qualified_path() {
        let p = ReferencePath::parse("performer.where(resolve() is Patient)").unwrap();
        assert_eq!(p.segments, vec!["performer"]);

        let p = ReferencePath::parse("participant.individual.where(resolve() is Patient)").unwrap();
        assert_eq!(p.segments, vec!["participant", "individual"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ReferencePath::parse("").is_err());
        assert!(ReferencePath::parse("a..b").is_err());
    }

    #[test]
    fn test_observation_subject_and_performer() {
        let paths = PatientPaths::standard();
        let observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/X"},
            "performer": [
                {"reference": "Practitioner/p1"},
                {"reference": "Patient/Y"}
            ]
        });

        let ids = paths.patient_ids("Observation", &observation);
        assert_eq!(ids, vec!["X", "Y"]);
    }

    #[test]
    fn test_non_patient_subject_is_excluded() {
        let paths = PatientPaths::standard();
        let observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Group/g1"}
        });

        assert!(paths.patient_ids("Observation", &observation).is_empty());
    }

    #[test]
    fn test_nested_path_through_arrays() {
        let paths = PatientPaths::standard();
        let encounter = json!({
            "resourceType": "Encounter",
            "participant": [
                {"individual": {"reference": "Practitioner/p1"}},
                {"individual": {"reference": "Patient/42"}}
            ]
        });

        assert_eq!(paths.patient_ids("Encounter", &encounter), vec!["42"]);
    }

    #[test]
    fn test_unknown_type_yields_empty() {
        let paths = PatientPaths::standard();
        let binary = json!({"resourceType": "Binary"});
        assert!(paths.patient_ids("Binary", &binary).is_empty());
        assert!(!paths.supports("Binary"));
    }

    #[test]
    fn test_duplicate_references_deduplicated() {
        let paths = PatientPaths::standard();
        let observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/X"},
            "performer": [{"reference": "Patient/X"}]
        });

        assert_eq!(paths.patient_ids("Observation", &observation), vec!["X"]);
    }

    #[test]
    fn test_from_json_override() {
        let doc = json!({
            "Observation": ["subject"],
            "Basic": ["author.where(resolve() is Patient)"]
        });
        let paths = PatientPaths::from_json(&doc).unwrap();

        assert!(paths.supports("Basic"));
        assert!(!paths.supports("Encounter"));

        let basic = json!({"author": {"reference": "Patient/7"}});
        assert_eq!(paths.patient_ids("Basic", &basic), vec!["7"]);
    }

    #[test]
    fn test_from_json_rejects_bad_shapes() {
        assert!(PatientPaths::from_json(&json!([])).is_err());
        assert!(PatientPaths::from_json(&json!({"Observation": "subject"})).is_err());
        assert!(PatientPaths::from_json(&json!({"Observation": [42]})).is_err());
    }
}
