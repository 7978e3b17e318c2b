//! Local change journal persistence for SQLite.
//!
//! The free functions take a `&Connection` so store mutations can call them
//! inside their own transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::core::LocalChangeStore;
use crate::error::{BackendError, StorageError, StorageResult};
use crate::journal;
use crate::types::{LocalChange, LocalChangeToken, LocalChangeType, SquashedLocalChange};

use super::{SqliteBackend, format_timestamp};

const CHANGE_COLUMNS: &str =
    "id, resource_type, resource_id, resource_uuid, timestamp, change_type, payload, version_id";

fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

/// Raw column values of one `local_changes` row.
type ChangeRow = (i64, String, String, String, String, String, String, Option<String>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<ChangeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_change(row: ChangeRow) -> StorageResult<LocalChange> {
    let (id, resource_type, resource_id, uuid, timestamp, change_type, payload, version_id) = row;
    Ok(LocalChange {
        id,
        resource_type,
        resource_id,
        resource_uuid: Uuid::parse_str(&uuid)
            .map_err(|e| serialization_error(format!("Invalid resource uuid {uuid}: {e}")))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| serialization_error(format!("Invalid timestamp {timestamp}: {e}")))?
            .with_timezone(&Utc),
        change_type: change_type.parse()?,
        payload,
        version_id,
    })
}

fn query_changes(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StorageResult<Vec<LocalChange>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM local_changes {filter} ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(params, read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_change).collect()
}

/// Appends a change and returns its id.
pub(crate) fn record(
    conn: &Connection,
    resource_type: &str,
    resource_id: &str,
    resource_uuid: Uuid,
    change_type: LocalChangeType,
    payload: &str,
    version_id: Option<&str>,
) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO local_changes
            (resource_type, resource_id, resource_uuid, timestamp, change_type, payload, version_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            resource_type,
            resource_id,
            resource_uuid.to_string(),
            format_timestamp(Utc::now()),
            change_type.to_string(),
            payload,
            version_id,
        ],
    )?;
    tracing::debug!(
        resource_type,
        resource_id,
        change_type = %change_type,
        "Recorded local change"
    );
    Ok(conn.last_insert_rowid())
}

/// Stores an already-built change (squashed or re-based) under a new id.
pub(crate) fn record_change(conn: &Connection, change: &LocalChange) -> StorageResult<i64> {
    record(
        conn,
        &change.resource_type,
        &change.resource_id,
        change.resource_uuid,
        change.change_type,
        &change.payload,
        change.version_id.as_deref(),
    )
}

pub(crate) fn changes_for_uuid(conn: &Connection, uuid: Uuid) -> StorageResult<Vec<LocalChange>> {
    query_changes(conn, "WHERE resource_uuid = ?1", [uuid.to_string()])
}

pub(crate) fn changes_for_resource(
    conn: &Connection,
    resource_type: &str,
    resource_id: &str,
) -> StorageResult<Vec<LocalChange>> {
    query_changes(
        conn,
        "WHERE resource_type = ?1 AND resource_id = ?2",
        [resource_type, resource_id],
    )
}

/// Type of the newest pending change recorded under `(type, id)`.
pub(crate) fn last_change_type(
    conn: &Connection,
    resource_type: &str,
    resource_id: &str,
) -> StorageResult<Option<LocalChangeType>> {
    let change_type: Option<String> = conn
        .query_row(
            "SELECT change_type FROM local_changes
             WHERE resource_type = ?1 AND resource_id = ?2
             ORDER BY id DESC LIMIT 1",
            [resource_type, resource_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(change_type.map(|t| t.parse()).transpose()?)
}

pub(crate) fn count_for_uuid(conn: &Connection, uuid: Uuid) -> StorageResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM local_changes WHERE resource_uuid = ?1",
        [uuid.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub(crate) fn delete_ids(conn: &Connection, ids: &[i64]) -> StorageResult<()> {
    let mut stmt = conn.prepare("DELETE FROM local_changes WHERE id = ?1")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

pub(crate) fn delete_for_uuid(conn: &Connection, uuid: Uuid) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM local_changes WHERE resource_uuid = ?1",
        [uuid.to_string()],
    )?;
    Ok(())
}

pub(crate) fn delete_for_resource(
    conn: &Connection,
    resource_type: &str,
    resource_id: &str,
) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM local_changes WHERE resource_type = ?1 AND resource_id = ?2",
        [resource_type, resource_id],
    )?;
    Ok(())
}

/// Overwrites the logical id and payload of a stored change.
pub(crate) fn rewrite(
    conn: &Connection,
    id: i64,
    resource_id: &str,
    payload: &str,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE local_changes SET resource_id = ?1, payload = ?2 WHERE id = ?3",
        params![resource_id, payload, id],
    )?;
    Ok(())
}

/// Replaces a resource's pending changes with one squashed record.
pub(crate) fn squash_in_place(conn: &Connection, uuid: Uuid) -> StorageResult<Option<LocalChange>> {
    let changes = changes_for_uuid(conn, uuid)?;
    if changes.len() < 2 {
        return Ok(changes.into_iter().next());
    }
    let Some(mut squashed) = journal::squash(&changes)? else {
        return Ok(None);
    };
    delete_for_uuid(conn, uuid)?;
    squashed.id = record_change(conn, &squashed)?;
    Ok(Some(squashed))
}

/// Groups every pending change by resource, ordered by each group's oldest id.
fn grouped_changes(conn: &Connection) -> StorageResult<Vec<Vec<LocalChange>>> {
    let mut groups: Vec<Vec<LocalChange>> = Vec::new();
    let mut positions: HashMap<Uuid, usize> = HashMap::new();
    for change in query_changes(conn, "", [])? {
        match positions.get(&change.resource_uuid) {
            Some(&i) => groups[i].push(change),
            None => {
                positions.insert(change.resource_uuid, groups.len());
                groups.push(vec![change]);
            }
        }
    }
    Ok(groups)
}

#[async_trait]
impl LocalChangeStore for SqliteBackend {
    async fn get_local_changes(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<LocalChange>> {
        let conn = self.get_connection()?;
        changes_for_resource(&conn, resource_type, id)
    }

    async fn get_all_local_changes(&self) -> StorageResult<Vec<LocalChange>> {
        let conn = self.get_connection()?;
        query_changes(&conn, "", [])
    }

    async fn pending_local_changes_count(&self) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM local_changes", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }

    async fn squashed_local_changes(&self) -> StorageResult<Vec<SquashedLocalChange>> {
        let conn = self.get_connection()?;
        let mut squashed = Vec::new();
        for group in grouped_changes(&conn)? {
            if let Some(change) = journal::squash_with_token(&group)? {
                squashed.push(change);
            }
        }
        Ok(squashed)
    }

    async fn earliest_pending_group(&self) -> StorageResult<Vec<LocalChange>> {
        let conn = self.get_connection()?;
        let uuid: Option<String> = conn
            .query_row(
                "SELECT resource_uuid FROM local_changes ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match uuid {
            Some(uuid) => query_changes(&conn, "WHERE resource_uuid = ?1", [uuid]),
            None => Ok(Vec::new()),
        }
    }

    async fn squash_local_changes(&self, resource_uuid: Uuid) -> StorageResult<Option<LocalChange>> {
        self.with_transaction(|tx| squash_in_place(tx, resource_uuid))
    }

    async fn discard_local_changes(&self, token: &LocalChangeToken) -> StorageResult<()> {
        self.with_transaction(|tx| delete_ids(tx, token.ids()))
    }

    async fn discard_resource_local_changes(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<()> {
        self.with_transaction(|tx| delete_for_resource(tx, resource_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_fixed_width_utc() {
        let backend = SqliteBackend::in_memory().unwrap();
        let conn = backend.get_connection().unwrap();
        let uuid = Uuid::new_v4();
        let id = record(&conn, "Patient", "p1", uuid, LocalChangeType::Insert, "{}", None).unwrap();

        let stored: String = conn
            .query_row("SELECT timestamp FROM local_changes WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .unwrap();
        // 2024-06-01T12:00:00.000Z
        assert_eq!(stored.len(), 24);
        assert!(stored.ends_with('Z'));
        assert_eq!(stored.as_bytes()[19], b'.');

        let changes = changes_for_uuid(&conn, uuid).unwrap();
        assert_eq!(changes[0].timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
