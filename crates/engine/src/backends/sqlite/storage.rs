//! ResourceStore and SyncStore implementations for SQLite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{ResourceStore, SyncStore};
use crate::error::{
    BackendError, ResourceError, SearchError, StateError, StorageError, StorageResult,
};
use crate::index::{IndexEntry, IndexFamily, IndexValue};
use crate::journal;
use crate::sync::{Conflict, ConflictResolution, ConflictResolver, UploadAck};
use crate::types::{
    LocalChangeType, ResourceRecord, Search, SquashedLocalChange, meta_last_updated,
    meta_version_id, resource_id_of, resource_type_of,
};

use super::{SqliteBackend, format_timestamp};
use super::local_changes;
use super::schema;
use super::search::{QueryBuilder, RESOURCE_COLUMNS};

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    })
}

fn not_found(resource_type: &str, id: &str) -> StorageError {
    StorageError::Resource(ResourceError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })
}

fn parse_timestamp(value: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| internal_error(format!("Invalid stored timestamp {s}: {e}")))
        })
        .transpose()
}

/// Raw column values of one `resources` row, in [`RESOURCE_COLUMNS`] order.
type RecordRow = (
    String,
    String,
    String,
    Vec<u8>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

/// Replaces every index row of a resource with `entries`.
fn write_indexes(
    conn: &Connection,
    resource_uuid: &str,
    resource_type: &str,
    entries: &[IndexEntry],
) -> StorageResult<()> {
    for family in IndexFamily::ALL {
        conn.prepare_cached(&format!(
            "DELETE FROM {} WHERE resource_uuid = ?1",
            family.table_name()
        ))?
        .execute([resource_uuid])?;
    }

    for entry in entries {
        let (uuid, name, path) = (resource_uuid, entry.name.as_str(), entry.path.as_str());
        match &entry.value {
            IndexValue::String(value) => conn
                .prepare_cached(
                    "INSERT INTO string_index
                        (resource_uuid, resource_type, index_name, index_path, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![uuid, resource_type, name, path, value])?,
            IndexValue::Token { system, code } => conn
                .prepare_cached(
                    "INSERT INTO token_index
                        (resource_uuid, resource_type, index_name, index_path, index_system, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![uuid, resource_type, name, path, system, code])?,
            IndexValue::Reference(value) => conn
                .prepare_cached(
                    "INSERT INTO reference_index
                        (resource_uuid, resource_type, index_name, index_path, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![uuid, resource_type, name, path, value])?,
            IndexValue::Quantity {
                value,
                system,
                code,
                unit,
            } => conn
                .prepare_cached(
                    "INSERT INTO quantity_index
                        (resource_uuid, resource_type, index_name, index_path,
                         index_system, index_code, index_unit, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?
                .execute(params![uuid, resource_type, name, path, system, code, unit, value])?,
            IndexValue::Number(value) => conn
                .prepare_cached(
                    "INSERT INTO number_index
                        (resource_uuid, resource_type, index_name, index_path, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![uuid, resource_type, name, path, value])?,
            IndexValue::Uri(value) => conn
                .prepare_cached(
                    "INSERT INTO uri_index
                        (resource_uuid, resource_type, index_name, index_path, index_value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![uuid, resource_type, name, path, value])?,
            IndexValue::Date { from, to } => conn
                .prepare_cached(
                    "INSERT INTO date_index
                        (resource_uuid, resource_type, index_name, index_path, index_from, index_to)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![uuid, resource_type, name, path, from, to])?,
            IndexValue::DateTime { from, to } => conn
                .prepare_cached(
                    "INSERT INTO date_time_index
                        (resource_uuid, resource_type, index_name, index_path, index_from, index_to)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![uuid, resource_type, name, path, from, to])?,
            IndexValue::Position {
                latitude,
                longitude,
            } => conn
                .prepare_cached(
                    "INSERT INTO position_index
                        (resource_uuid, resource_type, index_name, index_path, latitude, longitude)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![uuid, resource_type, name, path, latitude, longitude])?,
        };
    }
    Ok(())
}

impl SqliteBackend {
    fn record_from_row(&self, row: RecordRow) -> StorageResult<ResourceRecord> {
        let (uuid, resource_type, resource_id, bytes, version_id, lu_remote, lu_local) = row;
        let resource_uuid = Uuid::parse_str(&uuid)
            .map_err(|e| internal_error(format!("Invalid stored uuid {uuid}: {e}")))?;
        let content = self.codec.deserialize(&bytes, &resource_type)?;
        Ok(ResourceRecord::from_parts(
            resource_uuid,
            resource_type,
            resource_id,
            content,
            version_id,
            parse_timestamp(lu_remote)?,
            parse_timestamp(lu_local)?,
        ))
    }

    fn find_record(
        &self,
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Option<ResourceRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources a WHERE {filter}"),
                params,
                read_row,
            )
            .optional()?;
        row.map(|r| self.record_from_row(r)).transpose()
    }

    pub(crate) fn read_record(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<ResourceRecord>> {
        self.find_record(
            conn,
            "a.resource_type = ?1 AND a.resource_id = ?2",
            [resource_type, id],
        )
    }

    fn read_record_by_uuid(
        &self,
        conn: &Connection,
        uuid: Uuid,
    ) -> StorageResult<Option<ResourceRecord>> {
        self.find_record(conn, "a.resource_uuid = ?1", [uuid.to_string()])
    }

    /// Inserts a new row and its index entries.
    fn insert_record(&self, conn: &Connection, record: &ResourceRecord) -> StorageResult<()> {
        let uuid = record.resource_uuid().to_string();
        conn.execute(
            "INSERT INTO resources
                (resource_uuid, resource_type, resource_id, serialized_resource,
                 version_id, last_updated_remote, last_updated_local)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid,
                record.resource_type(),
                record.resource_id(),
                self.codec.serialize(record.content())?,
                record.version_id(),
                record.last_updated_remote().map(format_timestamp),
                record.last_updated_local().map(format_timestamp),
            ],
        )?;
        let entries = self.indexer.index(record.content())?;
        write_indexes(conn, &uuid, record.resource_type(), &entries)
    }

    /// Overwrites the row with the record's uuid and regenerates its indexes.
    fn write_record(&self, conn: &Connection, record: &ResourceRecord) -> StorageResult<()> {
        let uuid = record.resource_uuid().to_string();
        let updated = conn.execute(
            "UPDATE resources SET
                resource_id = ?1, serialized_resource = ?2, version_id = ?3,
                last_updated_remote = ?4, last_updated_local = ?5
             WHERE resource_uuid = ?6",
            params![
                record.resource_id(),
                self.codec.serialize(record.content())?,
                record.version_id(),
                record.last_updated_remote().map(format_timestamp),
                record.last_updated_local().map(format_timestamp),
                uuid,
            ],
        )?;
        if updated == 0 {
            return Err(not_found(record.resource_type(), record.resource_id()));
        }
        let entries = self.indexer.index(record.content())?;
        write_indexes(conn, &uuid, record.resource_type(), &entries)
    }

    /// Writes a server body, keeping the uuid of an existing row.
    fn upsert_remote(&self, conn: &Connection, resource: Value) -> StorageResult<()> {
        let resource_type = resource_type_of(&resource)?.to_string();
        let id = resource_id_of(&resource)?.to_string();
        match self.read_record(conn, &resource_type, &id)? {
            Some(existing) => {
                let record = ResourceRecord::from_parts(
                    existing.resource_uuid(),
                    resource_type,
                    id,
                    resource.clone(),
                    meta_version_id(&resource),
                    meta_last_updated(&resource),
                    existing.last_updated_local(),
                );
                self.write_record(conn, &record)
            }
            None => self.insert_record(conn, &ResourceRecord::new(resource)?),
        }
    }

    fn set_version_markers(
        &self,
        conn: &Connection,
        resource_uuid: Uuid,
        version_id: Option<&str>,
        last_updated: Option<DateTime<Utc>>,
    ) -> StorageResult<usize> {
        Ok(conn.execute(
            "UPDATE resources SET version_id = ?1, last_updated_remote = ?2
             WHERE resource_uuid = ?3",
            params![
                version_id,
                last_updated.map(format_timestamp),
                resource_uuid.to_string()
            ],
        )?)
    }

    /// Points every reference to `Type/old_id` in `body` at `new_id`.
    ///
    /// A `/_history/n` suffix is kept. Returns true if anything changed.
    fn rewrite_references(
        &self,
        body: &mut Value,
        resource_type: &str,
        old_id: &str,
        new_id: &str,
    ) -> bool {
        let old_url = format!("{resource_type}/{old_id}");
        let mut changed = false;
        for reference in self.codec.extract_references(body) {
            if reference.target_type != resource_type || reference.target_id != old_id {
                continue;
            }
            if let Some(Value::String(s)) = body.pointer_mut(&reference.path) {
                let suffix = s.strip_prefix(&old_url).unwrap_or_default().to_string();
                *s = format!("{resource_type}/{new_id}{suffix}");
                changed = true;
            }
        }
        changed
    }

    /// Renames a resource and rewrites everything that refers to it.
    fn rewrite_id(&self, conn: &Connection, old_id: &str, new_resource: Value) -> StorageResult<()> {
        let resource_type = resource_type_of(&new_resource)?.to_string();
        let new_id = resource_id_of(&new_resource)?.to_string();
        let record = self
            .read_record(conn, &resource_type, old_id)?
            .ok_or_else(|| not_found(&resource_type, old_id))?;
        if new_id != old_id && self.read_record(conn, &resource_type, &new_id)?.is_some() {
            return Err(StorageError::Resource(ResourceError::AlreadyExists {
                resource_type,
                id: new_id,
            }));
        }

        let uuid = record.resource_uuid();
        let renamed = ResourceRecord::from_parts(
            uuid,
            resource_type.clone(),
            new_id.clone(),
            new_resource.clone(),
            meta_version_id(&new_resource).or_else(|| record.version_id().map(String::from)),
            meta_last_updated(&new_resource).or(record.last_updated_remote()),
            record.last_updated_local(),
        );
        self.write_record(conn, &renamed)?;

        for change in local_changes::changes_for_uuid(conn, uuid)? {
            let payload = if change.change_type == LocalChangeType::Insert {
                let mut body: Value = serde_json::from_str(&change.payload)?;
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(new_id.clone()));
                }
                serde_json::to_string(&body)?
            } else {
                change.payload
            };
            local_changes::rewrite(conn, change.id, &new_id, &payload)?;
        }

        if new_id == old_id {
            return Ok(());
        }

        let old_url = format!("{resource_type}/{old_id}");
        let new_url = format!("{resource_type}/{new_id}");
        let referrers: Vec<String> = conn
            .prepare(
                "SELECT DISTINCT resource_uuid FROM reference_index
                 WHERE index_value = ?1 OR index_value LIKE ?2",
            )?
            .query_map(params![old_url, format!("{old_url}/_history/%")], |row| {
                row.get(0)
            })?
            .collect::<Result<_, _>>()?;

        for referrer_uuid in &referrers {
            let referrer_uuid = Uuid::parse_str(referrer_uuid)
                .map_err(|e| internal_error(format!("Invalid stored uuid {referrer_uuid}: {e}")))?;
            let Some(referrer) = self.read_record_by_uuid(conn, referrer_uuid)? else {
                continue;
            };
            let mut body = referrer.content().clone();
            if self.rewrite_references(&mut body, &resource_type, old_id, &new_id) {
                let rewritten = ResourceRecord::from_parts(
                    referrer_uuid,
                    referrer.resource_type().to_string(),
                    referrer.resource_id().to_string(),
                    body,
                    referrer.version_id().map(String::from),
                    referrer.last_updated_remote(),
                    referrer.last_updated_local(),
                );
                self.write_record(conn, &rewritten)?;
            }

            for change in local_changes::changes_for_uuid(conn, referrer_uuid)? {
                let mut payload: Value = match change.change_type {
                    LocalChangeType::Delete => continue,
                    _ => serde_json::from_str(&change.payload)?,
                };
                let changed = match change.change_type {
                    LocalChangeType::Insert => {
                        self.rewrite_references(&mut payload, &resource_type, old_id, &new_id)
                    }
                    _ => journal::replace_string_values(&mut payload, &old_url, &new_url),
                };
                if changed {
                    local_changes::rewrite(
                        conn,
                        change.id,
                        &change.resource_id,
                        &serde_json::to_string(&payload)?,
                    )?;
                }
            }
        }

        tracing::debug!(
            resource_type = %resource_type,
            old_id,
            new_id = %new_id,
            referrers = referrers.len(),
            "Rewrote resource id and references"
        );
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_local(&self, resources: Vec<Value>) -> StorageResult<Vec<String>> {
        self.with_transaction(|tx| {
            let mut ids = Vec::with_capacity(resources.len());
            for mut resource in resources {
                let resource_type = resource_type_of(&resource)?.to_string();
                let missing_id = resource
                    .get("id")
                    .and_then(Value::as_str)
                    .is_none_or(str::is_empty);
                if missing_id && let Some(obj) = resource.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
                }
                let id = resource_id_of(&resource)?.to_string();

                if self.read_record(tx, &resource_type, &id)?.is_some() {
                    return Err(StorageError::Resource(ResourceError::AlreadyExists {
                        resource_type,
                        id,
                    }));
                }
                journal::check_sequence(
                    &resource_type,
                    &id,
                    local_changes::last_change_type(tx, &resource_type, &id)?,
                    LocalChangeType::Insert,
                )?;

                let payload = serde_json::to_string(&resource)?;
                let version_id = meta_version_id(&resource);
                let last_updated = meta_last_updated(&resource);
                let record = ResourceRecord::from_parts(
                    Uuid::new_v4(),
                    resource_type.clone(),
                    id.clone(),
                    resource,
                    version_id,
                    last_updated,
                    Some(Utc::now()),
                );
                self.insert_record(tx, &record)?;
                local_changes::record(
                    tx,
                    &resource_type,
                    &id,
                    record.resource_uuid(),
                    LocalChangeType::Insert,
                    &payload,
                    record.version_id(),
                )?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    async fn insert_remote(&self, resources: Vec<Value>) -> StorageResult<()> {
        let count = resources.len();
        self.with_transaction(|tx| {
            for resource in resources {
                self.upsert_remote(tx, resource)?;
            }
            Ok(())
        })?;
        tracing::debug!(count, "Inserted remote resources");
        Ok(())
    }

    async fn update(&self, resource: Value) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let resource_type = resource_type_of(&resource)?.to_string();
            let id = resource_id_of(&resource)?.to_string();
            let current = self
                .read_record(tx, &resource_type, &id)?
                .ok_or_else(|| not_found(&resource_type, &id))?;

            let patch = journal::compute_diff(current.content(), &resource)?;
            if journal::is_empty_patch(&patch) {
                return Ok(());
            }
            journal::check_sequence(
                &resource_type,
                &id,
                local_changes::last_change_type(tx, &resource_type, &id)?,
                LocalChangeType::Update,
            )?;

            let updated = ResourceRecord::from_parts(
                current.resource_uuid(),
                resource_type.clone(),
                id.clone(),
                resource,
                current.version_id().map(String::from),
                current.last_updated_remote(),
                Some(Utc::now()),
            );
            self.write_record(tx, &updated)?;
            local_changes::record(
                tx,
                &resource_type,
                &id,
                updated.resource_uuid(),
                LocalChangeType::Update,
                &patch,
                updated.version_id(),
            )?;
            Ok(())
        })
    }

    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let Some(record) = self.read_record(tx, resource_type, id)? else {
                return Ok(());
            };
            tx.execute(
                "DELETE FROM resources WHERE resource_uuid = ?1",
                [record.resource_uuid().to_string()],
            )?;
            local_changes::record(
                tx,
                resource_type,
                id,
                record.resource_uuid(),
                LocalChangeType::Delete,
                "",
                record.version_id(),
            )?;
            Ok(())
        })
    }

    async fn get(&self, resource_type: &str, id: &str) -> StorageResult<Value> {
        Ok(self.get_record(resource_type, id).await?.into_content())
    }

    async fn get_record(&self, resource_type: &str, id: &str) -> StorageResult<ResourceRecord> {
        let conn = self.get_connection()?;
        self.read_record(&conn, resource_type, id)?
            .ok_or_else(|| not_found(resource_type, id))
    }

    async fn update_resource_id_and_references(
        &self,
        old_id: &str,
        new_resource: Value,
    ) -> StorageResult<()> {
        self.with_transaction(|tx| self.rewrite_id(tx, old_id, new_resource))
    }

    async fn purge(&self, resource_type: &str, id: &str, force: bool) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let record = self
                .read_record(tx, resource_type, id)?
                .ok_or_else(|| not_found(resource_type, id))?;
            let uuid = record.resource_uuid();
            let pending = local_changes::count_for_uuid(tx, uuid)?;
            if pending > 0 && !force {
                return Err(StorageError::State(StateError::PendingLocalChanges {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    count: pending,
                }));
            }
            local_changes::delete_for_uuid(tx, uuid)?;
            tx.execute(
                "DELETE FROM resources WHERE resource_uuid = ?1",
                [uuid.to_string()],
            )?;
            tracing::debug!(resource_type, id, discarded = pending, "Purged resource");
            Ok(())
        })
    }

    async fn search(&self, search: &Search) -> StorageResult<Vec<ResourceRecord>> {
        let conn = self.get_connection()?;
        ensure_full_text(&conn, search)?;

        let query = QueryBuilder::new(search).build()?;
        tracing::trace!(sql = %query.sql, "Executing search");
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt
            .query_map(params_from_iter(query.params.iter()), read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|row| self.record_from_row(row)).collect()
    }

    async fn count(&self, search: &Search) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        ensure_full_text(&conn, search)?;

        let query = QueryBuilder::new(search).build_count()?;
        let count: i64 = conn.query_row(
            &query.sql,
            params_from_iter(query.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn clear_database(&self) -> StorageResult<()> {
        let (resources, changes) = self.with_transaction(|tx| {
            let changes = tx.execute("DELETE FROM local_changes", [])?;
            tx.execute("DELETE FROM synced_resources", [])?;
            for family in IndexFamily::ALL {
                tx.execute(&format!("DELETE FROM {}", family.table_name()), [])?;
            }
            let resources = tx.execute("DELETE FROM resources", [])?;
            Ok((resources, changes))
        })?;
        tracing::info!(resources, discarded_changes = changes, "Cleared database");
        Ok(())
    }
}

/// Rejects full-text criteria when the database has no FTS table.
fn ensure_full_text(conn: &Connection, search: &Search) -> StorageResult<()> {
    match search.full_text_parameter() {
        Some(parameter) if !schema::has_fts_table(conn)? => Err(SearchError::InvalidFilter {
            parameter: parameter.to_string(),
            message: "full-text search is not available in this database".to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl SyncStore for SqliteBackend {
    async fn apply_remote_resources(
        &self,
        resources: Vec<Value>,
        resolver: &dyn ConflictResolver,
    ) -> StorageResult<usize> {
        let (applied, conflicts) = self.with_transaction(|tx| {
            let mut checkpoints: HashMap<String, DateTime<Utc>> = HashMap::new();
            let mut applied = 0usize;
            let mut conflicts = 0usize;

            for remote in resources {
                let resource_type = resource_type_of(&remote)?.to_string();
                let id = resource_id_of(&remote)?.to_string();
                if let Some(last_updated) = meta_last_updated(&remote) {
                    let checkpoint = checkpoints
                        .entry(resource_type.clone())
                        .or_insert(last_updated);
                    *checkpoint = (*checkpoint).max(last_updated);
                }

                let pending = local_changes::changes_for_resource(tx, &resource_type, &id)?;
                if pending.is_empty() {
                    self.upsert_remote(tx, remote)?;
                    applied += 1;
                    continue;
                }

                conflicts += 1;
                let local = self.read_record(tx, &resource_type, &id)?;
                let resolution = resolver.resolve(&Conflict {
                    resource_type: &resource_type,
                    resource_id: &id,
                    local: local.as_ref().map(ResourceRecord::content),
                    remote: &remote,
                    pending: &pending,
                });
                tracing::debug!(
                    resource_type = %resource_type,
                    id = %id,
                    resolution = ?resolution,
                    "Resolved download conflict"
                );

                match resolution {
                    ConflictResolution::AcceptRemote => {
                        local_changes::delete_for_resource(tx, &resource_type, &id)?;
                        self.upsert_remote(tx, remote)?;
                    }
                    ConflictResolution::AcceptLocal => {
                        // Pending changes may span a delete and re-insert; fold
                        // them as one lifecycle of the current row.
                        let uuid = local
                            .as_ref()
                            .map(ResourceRecord::resource_uuid)
                            .or_else(|| pending.last().map(|c| c.resource_uuid))
                            .unwrap_or_else(Uuid::new_v4);
                        let lifecycle: Vec<_> = pending
                            .into_iter()
                            .map(|mut change| {
                                change.resource_uuid = uuid;
                                change
                            })
                            .collect();
                        let squashed = journal::squash(&lifecycle)?.ok_or_else(|| {
                            internal_error(format!(
                                "No change to rebase for pending {resource_type}/{id}"
                            ))
                        })?;
                        let remote_version = meta_version_id(&remote);
                        let rebased = journal::rebase(
                            &squashed,
                            local.as_ref().map(ResourceRecord::content),
                            &remote,
                            remote_version.clone(),
                        )?;
                        local_changes::delete_for_resource(tx, &resource_type, &id)?;
                        local_changes::record_change(tx, &rebased)?;
                        if local.is_some() {
                            self.set_version_markers(
                                tx,
                                uuid,
                                remote_version.as_deref(),
                                meta_last_updated(&remote),
                            )?;
                        }
                    }
                }
                applied += 1;
            }

            for (resource_type, last_update) in checkpoints {
                tx.execute(
                    "INSERT INTO synced_resources (resource_type, last_update) VALUES (?1, ?2)
                     ON CONFLICT(resource_type) DO UPDATE SET last_update = excluded.last_update
                     WHERE excluded.last_update > synced_resources.last_update",
                    params![resource_type, format_timestamp(last_update)],
                )?;
            }
            Ok((applied, conflicts))
        })?;

        tracing::debug!(applied, conflicts, "Applied remote resources");
        Ok(applied)
    }

    async fn last_update(&self, resource_type: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let conn = self.get_connection()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT last_update FROM synced_resources WHERE resource_type = ?1",
                [resource_type],
                |row| row.get(0),
            )
            .optional()?;
        parse_timestamp(value)
    }

    async fn update_version_and_last_updated(
        &self,
        resource_type: &str,
        id: &str,
        version_id: Option<&str>,
        last_updated: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let record = self
                .read_record(tx, resource_type, id)?
                .ok_or_else(|| not_found(resource_type, id))?;
            self.set_version_markers(tx, record.resource_uuid(), version_id, last_updated)?;
            Ok(())
        })
    }

    async fn consolidate_upload(
        &self,
        squashed: &SquashedLocalChange,
        ack: &UploadAck,
    ) -> StorageResult<()> {
        let change = &squashed.change;
        self.with_transaction(|tx| {
            if change.change_type != LocalChangeType::Delete {
                if ack.resource_id != change.resource_id
                    && let Some(current) = self.read_record_by_uuid(tx, change.resource_uuid)?
                {
                    let old_id = current.resource_id().to_string();
                    let mut body = current.into_content();
                    if let Some(obj) = body.as_object_mut() {
                        obj.insert("id".to_string(), Value::String(ack.resource_id.clone()));
                    }
                    self.rewrite_id(tx, &old_id, body)?;
                }
                self.set_version_markers(
                    tx,
                    change.resource_uuid,
                    ack.version_id.as_deref(),
                    ack.last_updated,
                )?;
            }
            local_changes::delete_ids(tx, squashed.token.ids())
        })?;

        tracing::debug!(
            resource_type = %change.resource_type,
            id = %ack.resource_id,
            version = ?ack.version_id,
            "Consolidated upload"
        );
        Ok(())
    }
}
