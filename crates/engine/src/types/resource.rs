//! Stored resource records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ResourceError, StorageResult};

/// One locally known resource with its sync markers.
///
/// `resource_uuid` is assigned on first insert and never changes, even when
/// the server later assigns a different logical id. Indices and the local
/// change journal join on it.
///
/// # Examples
///
/// ```
/// use helios_engine::types::ResourceRecord;
/// use serde_json::json;
///
/// let record = ResourceRecord::new(json!({
///     "resourceType": "Patient",
///     "id": "p1",
///     "meta": {"versionId": "3"}
/// }))
/// .unwrap();
///
/// assert_eq!(record.url(), "Patient/p1");
/// assert_eq!(record.version_id(), Some("3"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    resource_uuid: Uuid,
    resource_type: String,
    resource_id: String,
    content: Value,
    version_id: Option<String>,
    last_updated_remote: Option<DateTime<Utc>>,
    last_updated_local: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    /// Creates a record with a fresh uuid from a body carrying `resourceType`
    /// and `id`. Version markers are read from `meta`.
    pub fn new(content: Value) -> StorageResult<Self> {
        let resource_type = resource_type_of(&content)?.to_string();
        let resource_id = resource_id_of(&content)?.to_string();
        Ok(Self {
            resource_uuid: Uuid::new_v4(),
            resource_type,
            resource_id,
            version_id: meta_version_id(&content),
            last_updated_remote: meta_last_updated(&content),
            last_updated_local: None,
            content,
        })
    }

    /// Reassembles a record read back from storage.
    pub fn from_parts(
        resource_uuid: Uuid,
        resource_type: String,
        resource_id: String,
        content: Value,
        version_id: Option<String>,
        last_updated_remote: Option<DateTime<Utc>>,
        last_updated_local: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            resource_uuid,
            resource_type,
            resource_id,
            content,
            version_id,
            last_updated_remote,
            last_updated_local,
        }
    }

    /// Returns the immutable surrogate key.
    pub fn resource_uuid(&self) -> Uuid {
        self.resource_uuid
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the logical id.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Returns the resource body.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes the record and returns the body.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns the last version acknowledged by the server.
    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }

    /// Returns the server's last-updated timestamp.
    pub fn last_updated_remote(&self) -> Option<DateTime<Utc>> {
        self.last_updated_remote
    }

    /// Returns when the resource was last changed locally.
    pub fn last_updated_local(&self) -> Option<DateTime<Utc>> {
        self.last_updated_local
    }

    /// Returns the relative reference (`Type/id`).
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}

/// Reads `resourceType` from a body.
pub fn resource_type_of(resource: &Value) -> StorageResult<&str> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ResourceError::Invalid {
                message: "missing resourceType".to_string(),
            }
            .into()
        })
}

/// Reads `id` from a body.
pub fn resource_id_of(resource: &Value) -> StorageResult<&str> {
    resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ResourceError::Invalid {
                message: "missing id".to_string(),
            }
            .into()
        })
}

/// Reads `meta.versionId`.
pub fn meta_version_id(resource: &Value) -> Option<String> {
    resource
        .pointer("/meta/versionId")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Reads `meta.lastUpdated`.
pub fn meta_last_updated(resource: &Value) -> Option<DateTime<Utc>> {
    resource
        .pointer("/meta/lastUpdated")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
