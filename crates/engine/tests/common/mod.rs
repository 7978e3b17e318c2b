//! Test infrastructure for the engine.
//!
//! Resource fixtures and a scripted [`DataSource`] standing in for a FHIR
//! server.

#![allow(dead_code)]

pub mod fixtures;
pub mod source;

pub use fixtures::*;
pub use source::*;

use helios_engine::backends::sqlite::SqliteBackend;

/// Creates an in-memory backend with the default search parameters.
pub fn create_backend() -> SqliteBackend {
    SqliteBackend::in_memory().expect("Failed to create SQLite backend")
}
