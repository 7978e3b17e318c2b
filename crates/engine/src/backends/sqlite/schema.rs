//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use crate::error::{BackendError, StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        // Fresh database - create base schema then run all migrations
        create_schema_v1(conn)?;
        set_schema_version(conn, 1)?;
        migrate_schema(conn, 1)?;
    } else if current_version < SCHEMA_VERSION {
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

fn migration_error(context: &str, e: rusqlite::Error) -> StorageError {
    StorageError::Backend(BackendError::MigrationError {
        message: format!("{}: {}", context, e),
    })
}

fn execute_all(conn: &Connection, statements: &[&str], context: &str) -> StorageResult<()> {
    for sql in statements {
        conn.execute(sql, []).map_err(|e| migration_error(context, e))?;
    }
    Ok(())
}

/// Get the current schema version.
pub(crate) fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| migration_error("Failed to create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| migration_error("Failed to clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| migration_error("Failed to set schema_version", e))?;
    Ok(())
}

/// Base tables: resources, one table per index family, the local change
/// journal and the download checkpoints.
fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    let tables = [
        "CREATE TABLE IF NOT EXISTS resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL UNIQUE,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            serialized_resource BLOB NOT NULL,
            version_id TEXT,
            last_updated_remote TEXT,
            last_updated_local TEXT,
            UNIQUE (resource_type, resource_id)
        )",
        "CREATE TABLE IF NOT EXISTS string_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_value TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS token_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_system TEXT,
            index_value TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS reference_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_value TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS quantity_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_system TEXT,
            index_code TEXT,
            index_unit TEXT,
            index_value REAL NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS number_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_value REAL NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS uri_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_value TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS date_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_from INTEGER NOT NULL,
            index_to INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS date_time_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            index_from INTEGER NOT NULL,
            index_to INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS position_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
            resource_type TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_path TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS local_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            resource_uuid TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            change_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            version_id TEXT
        )",
        "CREATE TABLE IF NOT EXISTS synced_resources (
            resource_type TEXT PRIMARY KEY,
            last_update TEXT NOT NULL
        )",
    ];
    execute_all(conn, &tables, "Failed to create table")?;
    create_indexes(conn)
}

fn create_indexes(conn: &Connection) -> StorageResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_resources_type ON resources(resource_type, resource_id)",
        // Per-parameter filtering and per-resource regeneration
        "CREATE INDEX IF NOT EXISTS idx_string_param ON string_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_string_value ON string_index(resource_type, index_name, index_value)",
        "CREATE INDEX IF NOT EXISTS idx_token_param ON token_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_token_value ON token_index(resource_type, index_name, index_value, index_system)",
        "CREATE INDEX IF NOT EXISTS idx_reference_param ON reference_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_reference_value ON reference_index(index_value)",
        "CREATE INDEX IF NOT EXISTS idx_quantity_param ON quantity_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_quantity_value ON quantity_index(resource_type, index_name, index_value)",
        "CREATE INDEX IF NOT EXISTS idx_number_param ON number_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_number_value ON number_index(resource_type, index_name, index_value)",
        "CREATE INDEX IF NOT EXISTS idx_uri_param ON uri_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_uri_value ON uri_index(resource_type, index_name, index_value)",
        "CREATE INDEX IF NOT EXISTS idx_date_param ON date_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_date_value ON date_index(resource_type, index_name, index_from, index_to)",
        "CREATE INDEX IF NOT EXISTS idx_date_time_param ON date_time_index(resource_type, index_name, resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_date_time_value ON date_time_index(resource_type, index_name, index_from, index_to)",
        "CREATE INDEX IF NOT EXISTS idx_position_param ON position_index(resource_type, index_name, resource_uuid)",
        // Journal lookups
        "CREATE INDEX IF NOT EXISTS idx_local_changes_uuid ON local_changes(resource_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_local_changes_resource ON local_changes(resource_type, resource_id)",
    ];
    execute_all(conn, &indexes, "Failed to create index")
}

/// Returns true if the SQLite build includes FTS5.
pub fn fts5_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT sqlite_compileoption_used('ENABLE_FTS5')",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|v| v != 0)
    .unwrap_or(false)
}

/// Returns true if the full-text table over string_index exists.
pub fn has_fts_table(conn: &Connection) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'string_index_fts'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Run schema migrations from current version to latest.
fn migrate_schema(conn: &Connection, from_version: i32) -> StorageResult<()> {
    let mut version = from_version;

    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            _ => {
                return Err(StorageError::Backend(BackendError::MigrationError {
                    message: format!("Unknown schema version: {}", version),
                }));
            }
        }
        version += 1;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Migrate from schema version 1 to version 2.
///
/// Adds `string_index_fts`, an external-content FTS5 table over
/// `string_index.index_value` kept current by triggers, and fills it from
/// existing rows. Skipped when FTS5 is not compiled in.
fn migrate_v1_to_v2(conn: &Connection) -> StorageResult<()> {
    if !fts5_available(conn) {
        tracing::warn!("FTS5 not available, full-text string search disabled");
        return Ok(());
    }

    let statements = [
        "CREATE VIRTUAL TABLE IF NOT EXISTS string_index_fts USING fts5(
            index_value,
            content='string_index',
            content_rowid='id'
        )",
        "CREATE TRIGGER IF NOT EXISTS string_index_fts_insert AFTER INSERT ON string_index BEGIN
            INSERT INTO string_index_fts(rowid, index_value) VALUES (new.id, new.index_value);
        END",
        "CREATE TRIGGER IF NOT EXISTS string_index_fts_delete AFTER DELETE ON string_index BEGIN
            INSERT INTO string_index_fts(string_index_fts, rowid, index_value)
            VALUES ('delete', old.id, old.index_value);
        END",
        "INSERT INTO string_index_fts(string_index_fts) VALUES ('rebuild')",
    ];
    execute_all(conn, &statements, "Failed to create full-text index")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_schema_initialization() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for table in [
            "resources",
            "string_index",
            "token_index",
            "reference_index",
            "quantity_index",
            "number_index",
            "uri_index",
            "date_index",
            "date_time_index",
            "position_index",
            "local_changes",
            "synced_resources",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_fts_tracks_string_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        initialize_schema(&conn).unwrap();
        assert!(has_fts_table(&conn).unwrap());

        conn.execute(
            "INSERT INTO resources (resource_uuid, resource_type, resource_id, serialized_resource)
             VALUES ('u1', 'Patient', 'p1', x'7b7d')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO string_index (resource_uuid, resource_type, index_name, index_path, index_value)
             VALUES ('u1', 'Patient', 'name', 'Patient.name', 'Margaret Hamilton')",
            [],
        )
        .unwrap();

        let matches = |conn: &Connection| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM string_index_fts WHERE string_index_fts MATCH '\"hamilton\"'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(matches(&conn), 1);

        // Cascading delete removes the index row and its full-text entry
        conn.execute("DELETE FROM resources WHERE resource_uuid = 'u1'", [])
            .unwrap();
        assert_eq!(matches(&conn), 0);
    }
}
