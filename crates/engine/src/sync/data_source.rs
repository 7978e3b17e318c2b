//! The remote data source consumed by the sync engine.
//!
//! The engine knows nothing about HTTP. It hands a [`DataSource`] requests
//! whose URLs are relative to the server base and gets back resources, or
//! one outcome per uploaded entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RemoteError;
use crate::types::{meta_last_updated, meta_version_id, resource_id_of, resource_type_of};

/// One page of a resource type's download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// The resource type being downloaded.
    pub resource_type: String,
    /// Relative search URL, or the server's continuation link.
    pub url: String,
}

/// A downloaded page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadResponse {
    /// Resources on this page.
    pub resources: Vec<Value>,
    /// Continuation link, if there are more pages.
    pub next_url: Option<String>,
}

/// Request method of an upload entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum UploadMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl UploadMethod {
    /// The HTTP verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMethod::Post => "POST",
            UploadMethod::Put => "PUT",
            UploadMethod::Patch => "PATCH",
            UploadMethod::Delete => "DELETE",
        }
    }
}

/// One squashed local change, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadEntry {
    /// Resource type.
    pub resource_type: String,
    /// Local logical id.
    pub resource_id: String,
    /// Request method.
    pub method: UploadMethod,
    /// Relative URL (`Type` for POST, `Type/id` otherwise).
    pub url: String,
    /// Resource body, or JSON patch for PATCH. `None` for DELETE.
    pub body: Option<Value>,
    /// Weak ETag of the base version (`W/"3"`), when known.
    pub if_match: Option<String>,
    /// Bundle-local identity (`urn:uuid:...`) of a POSTed resource, which
    /// other entries of the same bundle reference.
    pub full_url: Option<String>,
}

/// A batch of entries sent in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    /// Entries, in upload order.
    pub entries: Vec<UploadEntry>,
    /// Whether the entries go as one transaction bundle.
    pub bundle: bool,
}

impl UploadRequest {
    /// Renders the entries as a FHIR transaction `Bundle`.
    ///
    /// PATCH bodies are carried as `Binary` resources holding the JSON
    /// patch, as FHIR requires inside bundles.
    pub fn to_transaction_bundle(&self) -> Value {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| {
                let mut request = json!({
                    "method": entry.method.as_str(),
                    "url": entry.url,
                });
                if let Some(if_match) = &entry.if_match {
                    request["ifMatch"] = json!(if_match);
                }
                let mut bundle_entry = json!({ "request": request });
                if let Some(full_url) = &entry.full_url {
                    bundle_entry["fullUrl"] = json!(full_url);
                }
                match (&entry.body, entry.method) {
                    (Some(patch), UploadMethod::Patch) => {
                        bundle_entry["resource"] = json!({
                            "resourceType": "Binary",
                            "contentType": "application/json-patch+json",
                            "data": patch.to_string(),
                        });
                    }
                    (Some(body), _) => bundle_entry["resource"] = body.clone(),
                    (None, _) => {}
                }
                bundle_entry
            })
            .collect();
        json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": entries,
        })
    }
}

/// The server's acknowledgement of one accepted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    /// Resource type.
    pub resource_type: String,
    /// Logical id on the server, which may differ from the local one after
    /// a POST.
    pub resource_id: String,
    /// New version id.
    pub version_id: Option<String>,
    /// New `meta.lastUpdated`.
    pub last_updated: Option<DateTime<Utc>>,
}

impl UploadAck {
    /// Reads the acknowledgement from a returned resource body.
    pub fn from_resource(resource: &Value) -> Option<Self> {
        Some(Self {
            resource_type: resource_type_of(resource).ok()?.to_string(),
            resource_id: resource_id_of(resource).ok()?.to_string(),
            version_id: meta_version_id(resource),
            last_updated: meta_last_updated(resource),
        })
    }

    /// Reads the acknowledgement from a response `Location`
    /// (`[base/]Type/id[/_history/vid]`).
    pub fn from_location(location: &str, last_updated: Option<DateTime<Utc>>) -> Option<Self> {
        let segments: Vec<&str> = location.trim_end_matches('/').split('/').collect();
        let (type_index, version_id) = match segments.as_slice() {
            [.., _, _, "_history", vid] => (segments.len() - 4, Some(vid.to_string())),
            [.., _, _] => (segments.len() - 2, None),
            _ => return None,
        };
        let resource_type = segments[type_index];
        let resource_id = segments[type_index + 1];
        if !resource_type.starts_with(|c: char| c.is_ascii_uppercase()) || resource_id.is_empty() {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            version_id,
            last_updated,
        })
    }
}

/// What happened to one uploaded entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Stored by the server.
    Accepted(UploadAck),
    /// Refused; the change stays pending.
    Rejected(RemoteError),
}

/// The server's answer to an [`UploadRequest`].
///
/// `outcomes` pairs with the request's entries by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadResponse {
    /// One outcome per entry.
    pub outcomes: Vec<EntryOutcome>,
}

/// A remote FHIR server, as far as sync is concerned.
///
/// Returning `Err` fails the whole request; every entry of a failed upload
/// stays pending.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetches one page.
    async fn download(&self, request: DownloadRequest) -> Result<DownloadResponse, RemoteError>;

    /// Sends one batch.
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_from_location() {
        let ack = UploadAck::from_location("http://example.org/fhir/Patient/123/_history/2", None)
            .unwrap();
        assert_eq!(ack.resource_type, "Patient");
        assert_eq!(ack.resource_id, "123");
        assert_eq!(ack.version_id.as_deref(), Some("2"));

        let ack = UploadAck::from_location("Observation/o-9", None).unwrap();
        assert_eq!(ack.resource_id, "o-9");
        assert_eq!(ack.version_id, None);

        assert!(UploadAck::from_location("nothing", None).is_none());
    }

    #[test]
    fn test_ack_from_resource() {
        let ack = UploadAck::from_resource(&json!({
            "resourceType": "Patient",
            "id": "srv-1",
            "meta": {"versionId": "1", "lastUpdated": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(ack.resource_id, "srv-1");
        assert_eq!(ack.version_id.as_deref(), Some("1"));
        assert!(ack.last_updated.is_some());
    }

    #[test]
    fn test_transaction_bundle() {
        let request = UploadRequest {
            entries: vec![
                UploadEntry {
                    resource_type: "Patient".into(),
                    resource_id: "p1".into(),
                    method: UploadMethod::Post,
                    url: "Patient".into(),
                    body: Some(json!({"resourceType": "Patient", "id": "p1"})),
                    if_match: None,
                    full_url: Some("urn:uuid:6f1c2a9e-0000-4000-8000-000000000001".into()),
                },
                UploadEntry {
                    resource_type: "Patient".into(),
                    resource_id: "p2".into(),
                    method: UploadMethod::Patch,
                    url: "Patient/p2".into(),
                    body: Some(json!([{"op": "remove", "path": "/active"}])),
                    if_match: Some("W/\"4\"".into()),
                    full_url: None,
                },
            ],
            bundle: true,
        };
        let bundle = request.to_transaction_bundle();
        assert_eq!(bundle["type"], "transaction");
        assert_eq!(bundle["entry"][0]["request"]["method"], "POST");
        assert_eq!(
            bundle["entry"][0]["fullUrl"],
            "urn:uuid:6f1c2a9e-0000-4000-8000-000000000001"
        );
        assert!(bundle["entry"][1].get("fullUrl").is_none());
        assert_eq!(bundle["entry"][1]["request"]["ifMatch"], "W/\"4\"");
        assert_eq!(bundle["entry"][1]["resource"]["resourceType"], "Binary");
    }

    /// Acknowledges every entry from the `Location` it would be created at.
    struct EchoSource;

    #[async_trait]
    impl DataSource for EchoSource {
        async fn download(&self, request: DownloadRequest) -> Result<DownloadResponse, RemoteError> {
            Err(RemoteError::rejected(Some(404), request.url))
        }

        async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, RemoteError> {
            let outcomes = request
                .entries
                .iter()
                .map(|e| {
                    let location = format!("{}/{}/_history/1", e.resource_type, e.resource_id);
                    UploadAck::from_location(&location, None)
                        .map(EntryOutcome::Accepted)
                        .unwrap_or_else(|| {
                            EntryOutcome::Rejected(RemoteError::rejected(None, location))
                        })
                })
                .collect();
            Ok(UploadResponse { outcomes })
        }
    }

    #[test]
    fn test_data_source_as_trait_object() {
        let source: Box<dyn DataSource> = Box::new(EchoSource);

        let err = tokio_test::block_on(source.download(DownloadRequest {
            resource_type: "Patient".into(),
            url: "Patient?_sort=_lastUpdated".into(),
        }))
        .unwrap_err();
        assert!(!err.is_retryable());

        let response = tokio_test::block_on(source.upload(UploadRequest {
            entries: vec![UploadEntry {
                resource_type: "Patient".into(),
                resource_id: "p1".into(),
                method: UploadMethod::Put,
                url: "Patient/p1".into(),
                body: Some(json!({"resourceType": "Patient", "id": "p1"})),
                if_match: None,
                full_url: None,
            }],
            bundle: false,
        }))
        .unwrap();
        assert!(matches!(
            &response.outcomes[..],
            [EntryOutcome::Accepted(ack)] if ack.version_id.as_deref() == Some("1")
        ));
    }
}
