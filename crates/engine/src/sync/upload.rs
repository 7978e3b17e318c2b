//! Upload of squashed local changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::Database;
use crate::error::{RemoteError, ResourceSyncError, StorageResult};
use crate::journal;
use crate::resource::ResourceCodec;
use crate::types::{LocalChange, LocalChangeType, SquashedLocalChange};

use super::config::{CreateMethod, UpdateMethod, UploadConfig, UploadStrategy};
use super::data_source::{DataSource, EntryOutcome, UploadEntry, UploadMethod, UploadRequest};
use super::retry::{RetryConfig, retry_with_backoff};
use super::state::{SyncState, UploadProgress, UploadState};

/// Orders squashed changes for upload.
///
/// Changes keep their earliest-pending order, except that a pending INSERT
/// referenced by another pending INSERT goes before its referrer. A reference
/// cycle is broken at the change visited first.
pub(crate) fn order_for_upload(
    changes: Vec<SquashedLocalChange>,
    codec: &dyn ResourceCodec,
) -> Vec<SquashedLocalChange> {
    let position: HashMap<String, usize> = changes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.change.change_type == LocalChangeType::Insert)
        .map(|(i, c)| (format!("{}/{}", c.change.resource_type, c.change.resource_id), i))
        .collect();

    let dependencies: Vec<Vec<usize>> = changes
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if c.change.change_type != LocalChangeType::Insert {
                return Vec::new();
            }
            let Ok(body) = serde_json::from_str::<Value>(&c.change.payload) else {
                return Vec::new();
            };
            codec
                .extract_references(&body)
                .iter()
                .filter_map(|r| position.get(&r.url()).copied())
                .filter(|&target| target != i)
                .collect()
        })
        .collect();

    fn visit(
        i: usize,
        dependencies: &[Vec<usize>],
        visiting: &mut HashSet<usize>,
        emitted: &mut Vec<bool>,
        order: &mut Vec<usize>,
    ) {
        if emitted[i] || !visiting.insert(i) {
            return;
        }
        for &target in &dependencies[i] {
            visit(target, dependencies, visiting, emitted, order);
        }
        visiting.remove(&i);
        emitted[i] = true;
        order.push(i);
    }

    let mut emitted = vec![false; changes.len()];
    let mut order = Vec::with_capacity(changes.len());
    let mut visiting = HashSet::new();
    for i in 0..changes.len() {
        visit(i, &dependencies, &mut visiting, &mut emitted, &mut order);
    }

    let mut slots: Vec<Option<SquashedLocalChange>> = changes.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Builds the request entry for one squashed change.
///
/// `current` is the stored body, needed only for PUT updates.
pub(crate) fn build_entry(
    change: &LocalChange,
    current: Option<Value>,
    config: &UploadConfig,
) -> StorageResult<UploadEntry> {
    let resource_path = format!("{}/{}", change.resource_type, change.resource_id);
    let (method, url, body) = match change.change_type {
        LocalChangeType::Insert => {
            let body: Value = serde_json::from_str(&change.payload)?;
            match config.create_method {
                CreateMethod::Post => (UploadMethod::Post, change.resource_type.clone(), Some(body)),
                CreateMethod::Put => (UploadMethod::Put, resource_path, Some(body)),
            }
        }
        LocalChangeType::Update => match (config.update_method, current) {
            (UpdateMethod::Put, Some(body)) => (UploadMethod::Put, resource_path, Some(body)),
            _ => {
                let patch: Value = serde_json::from_str(&change.payload)?;
                (UploadMethod::Patch, resource_path, Some(patch))
            }
        },
        LocalChangeType::Delete => (UploadMethod::Delete, resource_path, None),
    };
    Ok(UploadEntry {
        resource_type: change.resource_type.clone(),
        resource_id: change.resource_id.clone(),
        method,
        url,
        body,
        if_match: change.version_id.as_ref().map(|v| format!("W/\"{v}\"")),
        full_url: None,
    })
}

/// Gives every POST entry of a bundle a `urn:uuid:` fullUrl and points the
/// references of the other entries at it.
///
/// The server resolves those references to the ids it assigns, so its copy
/// of a referrer agrees with the local one after consolidation. `changes`
/// pairs with `entries` by position.
pub(crate) fn link_bundle_creates(entries: &mut [UploadEntry], changes: &[&SquashedLocalChange]) {
    let mut full_urls = HashMap::new();
    for (entry, squashed) in entries.iter_mut().zip(changes) {
        if entry.method != UploadMethod::Post {
            continue;
        }
        let full_url = format!("urn:uuid:{}", squashed.change.resource_uuid);
        full_urls.insert(
            format!("{}/{}", entry.resource_type, entry.resource_id),
            full_url.clone(),
        );
        entry.full_url = Some(full_url);
    }
    if full_urls.is_empty() {
        return;
    }
    for body in entries.iter_mut().filter_map(|e| e.body.as_mut()) {
        point_at_full_urls(body, &full_urls);
    }
}

/// Replaces `reference` strings found in `full_urls`.
///
/// Patch operations setting a `.../reference` path carry the reference as
/// their `value`.
fn point_at_full_urls(value: &mut Value, full_urls: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            let sets_reference = map
                .get("path")
                .and_then(Value::as_str)
                .is_some_and(|path| path.ends_with("/reference"));
            let key = if sets_reference { "value" } else { "reference" };
            if let Some(Value::String(reference)) = map.get_mut(key)
                && let Some(full_url) = full_urls.get(reference.as_str())
            {
                *reference = full_url.clone();
            }
            for child in map.values_mut() {
                point_at_full_urls(child, full_urls);
            }
        }
        Value::Array(items) => {
            for item in items {
                point_at_full_urls(item, full_urls);
            }
        }
        _ => {}
    }
}

/// Everything the upload flow needs.
pub(crate) struct UploadContext<'a> {
    pub store: &'a Arc<dyn Database>,
    pub source: &'a Arc<dyn DataSource>,
    pub codec: &'a dyn ResourceCodec,
    pub config: &'a UploadConfig,
    pub retry: &'a RetryConfig,
    pub cancel: &'a CancellationToken,
    pub states: &'a broadcast::Sender<SyncState>,
}

/// Result of the upload flow.
#[derive(Debug, Default)]
pub(crate) struct UploadSummary {
    pub uploaded: usize,
    pub failures: Vec<ResourceSyncError>,
}

impl UploadContext<'_> {
    fn emit(&self, state: UploadState) {
        let _ = self.states.send(SyncState::Upload(state));
    }

    fn fail(&self, summary: &mut UploadSummary, progress: &mut UploadProgress, error: ResourceSyncError) {
        tracing::warn!(
            resource_type = %error.resource_type,
            error = %error,
            "Upload failed; change stays pending"
        );
        self.emit(UploadState::Failure(error.clone()));
        progress.last_error = Some(error.clone());
        summary.failures.push(error);
    }

    /// Uploads every pending change in batches.
    ///
    /// A change is discarded only after the server accepted it. Failures are
    /// collected per change and never stop later batches.
    pub(crate) async fn run(&self) -> UploadSummary {
        let mut summary = UploadSummary::default();

        let squashed = match self.store.squashed_local_changes().await {
            Ok(squashed) => squashed,
            Err(e) => {
                summary.failures.push(ResourceSyncError::new("*", e));
                return summary;
            }
        };
        let ordered = order_for_upload(squashed, self.codec);
        let mut progress = UploadProgress {
            pending: ordered.len(),
            total: ordered.len(),
            last_error: None,
        };
        self.emit(UploadState::Started {
            total: progress.total,
        });
        if ordered.is_empty() {
            return summary;
        }
        tracing::info!(total = progress.total, "Uploading local changes");

        let bundle = matches!(self.config.strategy, UploadStrategy::Bundle { .. });
        for batch in ordered.chunks(self.config.strategy.batch_size()) {
            if self.cancel.is_cancelled() {
                tracing::info!(pending = progress.pending, "Upload cancelled");
                break;
            }

            let mut sent = Vec::with_capacity(batch.len());
            let mut entries = Vec::with_capacity(batch.len());
            for squashed in batch {
                match self.entry_for(squashed).await {
                    Ok(entry) => {
                        entries.push(entry);
                        sent.push(squashed);
                    }
                    Err(e) => {
                        let error = ResourceSyncError::new(&squashed.change.resource_type, e);
                        self.fail(&mut summary, &mut progress, error);
                    }
                }
            }

            if !entries.is_empty() {
                if bundle {
                    link_bundle_creates(&mut entries, &sent);
                }
                let request = UploadRequest { entries, bundle };
                let response = retry_with_backoff(self.retry, self.cancel, || {
                    self.source.upload(request.clone())
                })
                .await;

                match response {
                    Ok(response) => {
                        let mut outcomes = response.outcomes.into_iter();
                        for squashed in sent {
                            let outcome = outcomes.next().unwrap_or_else(|| {
                                EntryOutcome::Rejected(RemoteError::rejected(
                                    None,
                                    "no outcome returned for entry",
                                ))
                            });
                            self.consolidate(squashed, outcome, &mut summary, &mut progress)
                                .await;
                        }
                    }
                    Err(e) => {
                        for squashed in sent {
                            let error =
                                ResourceSyncError::new(&squashed.change.resource_type, e.clone());
                            self.fail(&mut summary, &mut progress, error);
                        }
                    }
                }
            }

            progress.pending -= batch.len();
            self.emit(UploadState::Progress(progress.clone()));
        }

        tracing::info!(
            uploaded = summary.uploaded,
            failed = summary.failures.len(),
            "Upload finished"
        );
        summary
    }

    /// Builds the entry from the journal as it is now.
    ///
    /// Earlier batches may have rewritten references in these records, so
    /// the records named by the token are squashed again.
    async fn entry_for(&self, squashed: &SquashedLocalChange) -> StorageResult<UploadEntry> {
        let change = &squashed.change;
        if change.change_type == LocalChangeType::Delete {
            return build_entry(change, None, self.config);
        }
        let token = squashed.token.ids();
        let records: Vec<LocalChange> = self
            .store
            .get_local_changes(&change.resource_type, &change.resource_id)
            .await?
            .into_iter()
            .filter(|c| token.contains(&c.id))
            .collect();
        let change = journal::squash(&records)?.unwrap_or_else(|| change.clone());

        let current = match (change.change_type, self.config.update_method) {
            (LocalChangeType::Update, UpdateMethod::Put) => Some(
                self.store
                    .get(&change.resource_type, &change.resource_id)
                    .await?,
            ),
            _ => None,
        };
        build_entry(&change, current, self.config)
    }

    async fn consolidate(
        &self,
        squashed: &SquashedLocalChange,
        outcome: EntryOutcome,
        summary: &mut UploadSummary,
        progress: &mut UploadProgress,
    ) {
        let resource_type = &squashed.change.resource_type;
        match outcome {
            EntryOutcome::Accepted(ack) => {
                match self.store.consolidate_upload(squashed, &ack).await {
                    Ok(()) => {
                        tracing::debug!(
                            resource_type = %resource_type,
                            resource_id = %ack.resource_id,
                            "Change accepted"
                        );
                        summary.uploaded += 1;
                    }
                    Err(e) => self.fail(summary, progress, ResourceSyncError::new(resource_type, e)),
                }
            }
            EntryOutcome::Rejected(e) => {
                self.fail(summary, progress, ResourceSyncError::new(resource_type, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::JsonResourceCodec;
    use crate::types::LocalChangeToken;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn change(id: i64, change_type: LocalChangeType, resource: &str, payload: Value) -> SquashedLocalChange {
        let (resource_type, resource_id) = resource.split_once('/').unwrap();
        SquashedLocalChange {
            token: LocalChangeToken(vec![id]),
            change: LocalChange {
                id,
                resource_type: resource_type.into(),
                resource_id: resource_id.into(),
                resource_uuid: Uuid::new_v4(),
                timestamp: Utc::now(),
                change_type,
                payload: if payload.is_null() {
                    String::new()
                } else {
                    payload.to_string()
                },
                version_id: None,
            },
        }
    }

    fn ids(changes: &[SquashedLocalChange]) -> Vec<i64> {
        changes.iter().map(|c| c.change.id).collect()
    }

    #[test]
    fn test_referenced_inserts_go_first() {
        let changes = vec![
            change(
                1,
                LocalChangeType::Insert,
                "Observation/o1",
                json!({"resourceType": "Observation", "id": "o1",
                       "subject": {"reference": "Patient/p1"}}),
            ),
            change(2, LocalChangeType::Delete, "Patient/old", Value::Null),
            change(
                3,
                LocalChangeType::Insert,
                "Patient/p1",
                json!({"resourceType": "Patient", "id": "p1"}),
            ),
        ];
        let ordered = order_for_upload(changes, &JsonResourceCodec);
        assert_eq!(ids(&ordered), vec![3, 1, 2]);
    }

    #[test]
    fn test_reference_cycle_terminates() {
        let changes = vec![
            change(
                1,
                LocalChangeType::Insert,
                "Patient/a",
                json!({"resourceType": "Patient", "id": "a", "link": [{"other": {"reference": "Patient/b"}}]}),
            ),
            change(
                2,
                LocalChangeType::Insert,
                "Patient/b",
                json!({"resourceType": "Patient", "id": "b", "link": [{"other": {"reference": "Patient/a"}}]}),
            ),
        ];
        let ordered = order_for_upload(changes, &JsonResourceCodec);
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[test]
    fn test_build_entry_methods() {
        let config = UploadConfig::default();
        let insert = change(1, LocalChangeType::Insert, "Patient/p1", json!({"resourceType": "Patient", "id": "p1"}));
        let entry = build_entry(&insert.change, None, &config).unwrap();
        assert_eq!(entry.method, UploadMethod::Post);
        assert_eq!(entry.url, "Patient");

        let put_config = UploadConfig {
            create_method: CreateMethod::Put,
            update_method: UpdateMethod::Put,
            ..config
        };
        let entry = build_entry(&insert.change, None, &put_config).unwrap();
        assert_eq!(entry.method, UploadMethod::Put);
        assert_eq!(entry.url, "Patient/p1");

        let mut update = change(
            2,
            LocalChangeType::Update,
            "Patient/p1",
            json!([{"op": "replace", "path": "/gender", "value": "female"}]),
        );
        update.change.version_id = Some("3".into());
        let entry = build_entry(&update.change, None, &config).unwrap();
        assert_eq!(entry.method, UploadMethod::Patch);
        assert_eq!(entry.if_match.as_deref(), Some("W/\"3\""));
        assert!(entry.body.unwrap().is_array());

        let current = json!({"resourceType": "Patient", "id": "p1", "gender": "female"});
        let entry = build_entry(&update.change, Some(current.clone()), &put_config).unwrap();
        assert_eq!(entry.method, UploadMethod::Put);
        assert_eq!(entry.body, Some(current));

        let delete = change(3, LocalChangeType::Delete, "Patient/p1", Value::Null);
        let entry = build_entry(&delete.change, None, &config).unwrap();
        assert_eq!(entry.method, UploadMethod::Delete);
        assert_eq!(entry.body, None);
    }

    #[test]
    fn test_bundle_creates_are_linked_by_full_url() {
        let config = UploadConfig::default();
        let changes = vec![
            change(1, LocalChangeType::Insert, "Patient/p1", json!({"resourceType": "Patient", "id": "p1"})),
            change(
                2,
                LocalChangeType::Insert,
                "Observation/o1",
                json!({"resourceType": "Observation", "id": "o1",
                       "subject": {"reference": "Patient/p1"},
                       "performer": [{"reference": "Practitioner/dr"}]}),
            ),
            change(
                3,
                LocalChangeType::Update,
                "Encounter/e1",
                json!([{"op": "replace", "path": "/subject/reference", "value": "Patient/p1"}]),
            ),
        ];
        let sent: Vec<&SquashedLocalChange> = changes.iter().collect();
        let mut entries: Vec<UploadEntry> = changes
            .iter()
            .map(|c| build_entry(&c.change, None, &config).unwrap())
            .collect();

        link_bundle_creates(&mut entries, &sent);

        let patient_url = format!("urn:uuid:{}", changes[0].change.resource_uuid);
        assert_eq!(entries[0].full_url.as_deref(), Some(patient_url.as_str()));
        assert!(entries[1].full_url.is_some());
        assert_eq!(entries[2].full_url, None);

        let observation = entries[1].body.as_ref().unwrap();
        assert_eq!(observation["subject"]["reference"], patient_url.as_str());
        assert_eq!(observation["performer"][0]["reference"], "Practitioner/dr");
        let patch = entries[2].body.as_ref().unwrap();
        assert_eq!(patch[0]["value"], patient_url.as_str());
    }

    #[test]
    fn test_put_creates_need_no_full_url() {
        let config = UploadConfig {
            create_method: CreateMethod::Put,
            ..UploadConfig::default()
        };
        let changes = vec![
            change(1, LocalChangeType::Insert, "Patient/p1", json!({"resourceType": "Patient", "id": "p1"})),
            change(
                2,
                LocalChangeType::Insert,
                "Observation/o1",
                json!({"resourceType": "Observation", "id": "o1", "subject": {"reference": "Patient/p1"}}),
            ),
        ];
        let sent: Vec<&SquashedLocalChange> = changes.iter().collect();
        let mut entries: Vec<UploadEntry> = changes
            .iter()
            .map(|c| build_entry(&c.change, None, &config).unwrap())
            .collect();

        link_bundle_creates(&mut entries, &sent);

        assert!(entries.iter().all(|e| e.full_url.is_none()));
        assert_eq!(entries[1].body.as_ref().unwrap()["subject"]["reference"], "Patient/p1");
    }
}
