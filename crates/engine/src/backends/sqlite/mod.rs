//! SQLite backend implementation.
//!
//! One database file holds the resources, their search indexes, the local
//! change journal and the download checkpoints. In-memory databases are
//! available for tests; file databases can be encrypted when the crate is
//! built with the `sqlcipher` feature.
//!
//! # Example
//!
//! ```no_run
//! use helios_engine::backends::sqlite::SqliteBackend;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Schema is created on open
//! let backend = SqliteBackend::in_memory()?;
//! backend.health_check()?;
//!
//! let backend = SqliteBackend::open("./data/engine.db")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE resources (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_uuid TEXT NOT NULL UNIQUE,
//!     resource_type TEXT NOT NULL,
//!     resource_id TEXT NOT NULL,
//!     serialized_resource BLOB NOT NULL,
//!     version_id TEXT,
//!     last_updated_remote TEXT,
//!     last_updated_local TEXT,
//!     UNIQUE (resource_type, resource_id)
//! );
//!
//! -- One table per index family: string, token, reference, quantity,
//! -- number, uri, date, date_time, position. Rows cascade with the resource.
//! CREATE TABLE string_index (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_uuid TEXT NOT NULL REFERENCES resources(resource_uuid) ON DELETE CASCADE,
//!     resource_type TEXT NOT NULL,
//!     index_name TEXT NOT NULL,
//!     index_path TEXT NOT NULL,
//!     index_value TEXT NOT NULL
//! );
//!
//! CREATE TABLE local_changes (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_type TEXT NOT NULL,
//!     resource_id TEXT NOT NULL,
//!     resource_uuid TEXT NOT NULL,
//!     timestamp TEXT NOT NULL,
//!     change_type TEXT NOT NULL,  -- INSERT, UPDATE or DELETE
//!     payload TEXT NOT NULL,      -- full body, JSON patch, or empty
//!     version_id TEXT
//! );
//!
//! CREATE TABLE synced_resources (
//!     resource_type TEXT PRIMARY KEY,
//!     last_update TEXT NOT NULL
//! );
//! ```
//!
//! Schema version 2 adds `string_index_fts`, an FTS5 table over
//! `string_index` used by `:text` searches, when FTS5 is compiled in.

mod backend;
mod local_changes;
pub(crate) mod schema;
pub mod search;
mod storage;

pub use backend::{SqliteBackend, SqliteBackendConfig};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC form, so stored timestamps compare as text.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
