//! A scripted data source.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use helios_engine::error::RemoteError;
use helios_engine::sync::{
    DataSource, DownloadRequest, DownloadResponse, EntryOutcome, UploadAck, UploadMethod,
    UploadRequest, UploadResponse,
};

/// The `lastUpdated` the scripted server stamps on acknowledged uploads.
pub fn ack_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A pause inside the first download, for cancelling mid-cycle.
#[derive(Default)]
pub struct DownloadGate {
    /// Notified once the first download request arrives.
    pub entered: Notify,
    /// The request waits for this before answering.
    pub release: Notify,
}

/// Serves download pages by URL and acknowledges uploads.
///
/// The first page of a type is found by type, later pages by exact URL.
/// POSTed resources get ids `srv-1`, `srv-2`, ... in upload order, and
/// references to an entry's `fullUrl` resolve to the id it was given.
#[derive(Default)]
pub struct ScriptedSource {
    first_pages: Mutex<HashMap<String, Result<DownloadResponse, RemoteError>>>,
    pages: Mutex<HashMap<String, DownloadResponse>>,
    rejected: Mutex<HashSet<String>>,
    transient_upload_failures: AtomicUsize,
    assigned: AtomicUsize,
    gate: Option<Arc<DownloadGate>>,

    /// Every download request, in order.
    pub downloads: Mutex<Vec<DownloadRequest>>,
    /// Every upload request, in order.
    pub uploads: Mutex<Vec<UploadRequest>>,
    /// The server's copy of every POSTed or PUT resource, by `Type/id`.
    pub stored: Mutex<HashMap<String, Value>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses the first download on `gate`.
    pub fn with_gate(mut self, gate: Arc<DownloadGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Serves `resources` as the first page of `resource_type`.
    pub fn with_first_page(
        self,
        resource_type: &str,
        resources: Vec<Value>,
        next_url: Option<&str>,
    ) -> Self {
        self.first_pages.lock().insert(
            resource_type.to_string(),
            Ok(DownloadResponse {
                resources,
                next_url: next_url.map(String::from),
            }),
        );
        self
    }

    /// Fails every first-page request of `resource_type`.
    pub fn with_download_error(self, resource_type: &str, error: RemoteError) -> Self {
        self.first_pages
            .lock()
            .insert(resource_type.to_string(), Err(error));
        self
    }

    /// Serves `resources` at `url`.
    pub fn with_page(self, url: &str, resources: Vec<Value>, next_url: Option<&str>) -> Self {
        self.pages.lock().insert(
            url.to_string(),
            DownloadResponse {
                resources,
                next_url: next_url.map(String::from),
            },
        );
        self
    }

    /// Rejects uploads of `Type/id`.
    pub fn rejecting(self, resource: &str) -> Self {
        self.rejected.lock().insert(resource.to_string());
        self
    }

    /// Fails the next `count` upload requests with a transient error.
    pub fn with_transient_upload_failures(self, count: usize) -> Self {
        self.transient_upload_failures
            .store(count, Ordering::SeqCst);
        self
    }

    /// Number of upload requests received.
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    /// All upload entries received, flattened.
    pub fn uploaded_entries(&self) -> Vec<helios_engine::sync::UploadEntry> {
        self.uploads
            .lock()
            .iter()
            .flat_map(|r| r.entries.clone())
            .collect()
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    async fn download(&self, request: DownloadRequest) -> Result<DownloadResponse, RemoteError> {
        let first = self.downloads.lock().is_empty();
        self.downloads.lock().push(request.clone());
        if first && let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if let Some(page) = self.pages.lock().get(&request.url) {
            return Ok(page.clone());
        }
        if request.url.starts_with(&format!("{}?", request.resource_type))
            && let Some(page) = self.first_pages.lock().get(&request.resource_type)
        {
            return page.clone();
        }
        Ok(DownloadResponse::default())
    }

    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, RemoteError> {
        self.uploads.lock().push(request.clone());
        if self
            .transient_upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::transient("connection reset"));
        }

        let rejected = self.rejected.lock();
        let outcomes: Vec<EntryOutcome> = request
            .entries
            .iter()
            .map(|entry| {
                let key = format!("{}/{}", entry.resource_type, entry.resource_id);
                if rejected.contains(&key) {
                    return EntryOutcome::Rejected(RemoteError::rejected(
                        Some(422),
                        format!("{key} failed validation"),
                    ));
                }
                let (resource_id, version) = match entry.method {
                    UploadMethod::Post => {
                        let n = self.assigned.fetch_add(1, Ordering::SeqCst) + 1;
                        (format!("srv-{n}"), "1")
                    }
                    UploadMethod::Put if entry.if_match.is_none() => {
                        (entry.resource_id.clone(), "1")
                    }
                    _ => (entry.resource_id.clone(), "2"),
                };
                EntryOutcome::Accepted(UploadAck {
                    resource_type: entry.resource_type.clone(),
                    resource_id,
                    version_id: Some(version.to_string()),
                    last_updated: Some(ack_time()),
                })
            })
            .collect();

        let assigned: HashMap<String, String> = request
            .entries
            .iter()
            .zip(&outcomes)
            .filter_map(|(entry, outcome)| match (&entry.full_url, outcome) {
                (Some(full_url), EntryOutcome::Accepted(ack)) => Some((
                    full_url.clone(),
                    format!("{}/{}", ack.resource_type, ack.resource_id),
                )),
                _ => None,
            })
            .collect();
        let mut stored = self.stored.lock();
        for (entry, outcome) in request.entries.iter().zip(&outcomes) {
            let EntryOutcome::Accepted(ack) = outcome else {
                continue;
            };
            if !matches!(entry.method, UploadMethod::Post | UploadMethod::Put) {
                continue;
            }
            let Some(mut body) = entry.body.clone() else {
                continue;
            };
            resolve_full_urls(&mut body, &assigned);
            body["id"] = Value::String(ack.resource_id.clone());
            stored.insert(format!("{}/{}", ack.resource_type, ack.resource_id), body);
        }

        Ok(UploadResponse { outcomes })
    }
}

/// Points `urn:uuid:` references at the resources they were assigned to.
fn resolve_full_urls(value: &mut Value, assigned: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get_mut("reference")
                && let Some(resolved) = assigned.get(reference.as_str())
            {
                *reference = resolved.clone();
            }
            for child in map.values_mut() {
                resolve_full_urls(child, assigned);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_full_urls(item, assigned);
            }
        }
        _ => {}
    }
}
