//! Local change journal records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LocalChangeError, StorageResult};

/// The kind of mutation a local change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocalChangeType {
    /// Payload is the full resource body.
    Insert,
    /// Payload is a JSON patch from the previous body.
    Update,
    /// Payload is empty.
    Delete,
}

impl fmt::Display for LocalChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalChangeType::Insert => write!(f, "INSERT"),
            LocalChangeType::Update => write!(f, "UPDATE"),
            LocalChangeType::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for LocalChangeType {
    type Err = LocalChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(LocalChangeType::Insert),
            "UPDATE" => Ok(LocalChangeType::Update),
            "DELETE" => Ok(LocalChangeType::Delete),
            other => Err(LocalChangeError::UnknownType {
                value: other.to_string(),
            }),
        }
    }
}

/// One recorded offline mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    /// Monotonic journal id.
    pub id: i64,
    /// Resource type.
    pub resource_type: String,
    /// Logical id at the time of reading (rewritten on id reassignment).
    pub resource_id: String,
    /// Surrogate key of the resource.
    pub resource_uuid: Uuid,
    /// When the change was recorded.
    pub timestamp: DateTime<Utc>,
    /// Kind of mutation.
    pub change_type: LocalChangeType,
    /// Serialized payload: full body, JSON patch, or empty.
    pub payload: String,
    /// Remote version the change is based on, if known.
    pub version_id: Option<String>,
}

impl LocalChange {
    /// Parses the payload as JSON. Returns `Value::Null` for DELETE.
    pub fn payload_json(&self) -> StorageResult<Value> {
        if self.payload.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Returns the relative reference (`Type/id`).
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}

/// The journal ids consumed by one squashed change.
///
/// Upload discards by token so edits recorded while an upload is in flight
/// stay pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalChangeToken(pub Vec<i64>);

impl LocalChangeToken {
    /// Returns the journal ids.
    pub fn ids(&self) -> &[i64] {
        &self.0
    }

    /// Returns true if no ids are held.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A squashed change together with the token of the records it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct SquashedLocalChange {
    /// Ids of the folded records.
    pub token: LocalChangeToken,
    /// The equivalent single change.
    pub change: LocalChange,
}
