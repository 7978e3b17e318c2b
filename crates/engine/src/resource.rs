//! Resource serialization collaborator.
//!
//! The store keeps resources as opaque bytes plus a type tag; conversion to
//! and from the JSON body happens only at the public API edge through a
//! [`ResourceCodec`].

use serde_json::Value;

use crate::error::{BackendError, StorageResult};

/// A reference field inside a resource body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    /// JSON pointer to the reference string (e.g. `/subject/reference`).
    pub path: String,
    /// Referenced resource type.
    pub target_type: String,
    /// Referenced logical id.
    pub target_id: String,
}

impl ResourceReference {
    /// Returns the relative reference (`Type/id`).
    pub fn url(&self) -> String {
        format!("{}/{}", self.target_type, self.target_id)
    }
}

/// Serializes resources and finds the references they hold.
pub trait ResourceCodec: Send + Sync {
    /// Canonical serialization of a body.
    fn serialize(&self, resource: &Value) -> StorageResult<Vec<u8>>;

    /// Parses stored bytes back into a body of the given type.
    fn deserialize(&self, bytes: &[u8], resource_type: &str) -> StorageResult<Value>;

    /// Every `Type/id` reference in the body.
    fn extract_references(&self, resource: &Value) -> Vec<ResourceReference>;
}

/// JSON codec over `serde_json`.
///
/// References are the `reference` strings of any nested object whose value
/// is a relative literal reference. Contained (`#id`), `urn:` and absolute
/// references are not rewritable and are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResourceCodec;

impl JsonResourceCodec {
    fn collect(value: &Value, path: &mut String, out: &mut Vec<ResourceReference>) {
        match value {
            Value::Object(obj) => {
                if let Some((target_type, target_id)) = obj
                    .get("reference")
                    .and_then(Value::as_str)
                    .and_then(parse_relative_reference)
                {
                    out.push(ResourceReference {
                        path: format!("{path}/reference"),
                        target_type: target_type.to_string(),
                        target_id: target_id.to_string(),
                    });
                }
                for (key, child) in obj {
                    if key == "contained" {
                        continue;
                    }
                    let len = path.len();
                    path.push('/');
                    path.push_str(&key.replace('~', "~0").replace('/', "~1"));
                    Self::collect(child, path, out);
                    path.truncate(len);
                }
            }
            Value::Array(arr) => {
                for (i, child) in arr.iter().enumerate() {
                    let len = path.len();
                    path.push('/');
                    path.push_str(&i.to_string());
                    Self::collect(child, path, out);
                    path.truncate(len);
                }
            }
            _ => {}
        }
    }
}

impl ResourceCodec for JsonResourceCodec {
    fn serialize(&self, resource: &Value) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(resource)?)
    }

    fn deserialize(&self, bytes: &[u8], resource_type: &str) -> StorageResult<Value> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value.get("resourceType").and_then(Value::as_str) {
            Some(t) if t == resource_type => Ok(value),
            other => Err(BackendError::SerializationError {
                message: format!(
                    "expected resourceType {resource_type}, found {}",
                    other.unwrap_or("none")
                ),
            }
            .into()),
        }
    }

    fn extract_references(&self, resource: &Value) -> Vec<ResourceReference> {
        let mut out = Vec::new();
        Self::collect(resource, &mut String::new(), &mut out);
        out
    }
}

/// Splits `Type/id` (optionally followed by `/_history/n`) into its parts.
pub fn parse_relative_reference(reference: &str) -> Option<(&str, &str)> {
    if reference.starts_with('#') || reference.contains(':') {
        return None;
    }
    let mut parts = reference.split('/');
    let target_type = parts.next()?;
    let target_id = parts.next()?;
    let starts_upper = target_type.chars().next().is_some_and(char::is_uppercase);
    if !starts_upper || target_id.is_empty() {
        return None;
    }
    match (parts.next(), parts.next(), parts.next()) {
        (None, _, _) | (Some("_history"), Some(_), None) => Some((target_type, target_id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let codec = JsonResourceCodec;
        let patient = json!({"resourceType": "Patient", "id": "p1", "active": true});
        let bytes = codec.serialize(&patient).unwrap();
        assert_eq!(codec.deserialize(&bytes, "Patient").unwrap(), patient);
        assert!(codec.deserialize(&bytes, "Observation").is_err());
    }

    #[test]
    fn test_extract_references_with_paths() {
        let observation = json!({
            "resourceType": "Observation",
            "id": "o1",
            "subject": {"reference": "Patient/p1"},
            "performer": [
                {"reference": "Practitioner/dr/_history/2"},
                {"reference": "#contained"},
                {"reference": "http://example.org/fhir/Patient/p9"}
            ],
            "contained": [{"resourceType": "Patient", "id": "contained",
                           "link": [{"other": {"reference": "Patient/p2"}}]}]
        });
        let refs = JsonResourceCodec.extract_references(&observation);
        let mut found: Vec<_> = refs.iter().map(|r| (r.path.as_str(), r.url())).collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("/performer/0/reference", "Practitioner/dr".to_string()),
                ("/subject/reference", "Patient/p1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_relative_reference() {
        assert_eq!(parse_relative_reference("Patient/1"), Some(("Patient", "1")));
        assert_eq!(parse_relative_reference("Patient"), None);
        assert_eq!(parse_relative_reference("urn:uuid:abc"), None);
        assert_eq!(parse_relative_reference("Patient/1/extra"), None);
    }
}
