//! Helios Offline Engine
//!
//! This crate provides an offline-first store for FHIR resources. Resources
//! are kept locally with a search index, every local mutation is journaled,
//! and a sync engine exchanges data with a remote FHIR server.
//!
//! # Features
//!
//! - **Local store**: CRUD on JSON resources with version markers
//! - **Search**: String, token, reference, URI, number, quantity, date and full-text filters
//! - **Local change journal**: INSERT/UPDATE/DELETE records with JSON Patch payloads, squashing and rebasing
//! - **Sync**: paginated incremental download, conflict resolution and ordered upload
//! - **Encryption**: SQLCipher databases keyed by a [`PassphraseProvider`](encryption::PassphraseProvider)
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite with in-memory and file modes
//! - `sqlcipher` - SQLite with SQLCipher encryption
//! - `logging` - [`init_logging`] console subscriber
//!
//! # Architecture
//!
//! - [`types`] - Stored records, journal records and search types
//! - [`error`] - Error types for all operations
//! - [`index`] - Search parameter definitions and index extraction
//! - [`journal`] - Diffing, squashing and rebasing of local changes
//! - [`core`] - Store traits
//! - [`backends`] - Store implementations
//! - [`sync`] - Download, upload and the [`SyncEngine`]
//! - [`config`] - Configuration from serde or the environment
//!
//! # Quick Start
//!
//! ```no_run
//! use helios_engine::backends::sqlite::SqliteBackend;
//! use helios_engine::core::{LocalChangeStore, ResourceStore};
//! use helios_engine::types::{FilterCriterion, Search, SearchFilter, StringModifier};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteBackend::open("./data/engine.db")?;
//!
//! store
//!     .insert_local(vec![json!({
//!         "resourceType": "Patient",
//!         "id": "p1",
//!         "name": [{"family": "Smith", "given": ["John"]}]
//!     })])
//!     .await?;
//!
//! let search = Search::new("Patient").with_filter(SearchFilter::new(
//!     "family",
//!     vec![FilterCriterion::string("smi", StringModifier::StartsWith)],
//! ));
//! let found = store.search(&search).await?;
//! assert_eq!(found.len(), 1);
//!
//! // The insert waits in the journal until it is uploaded
//! assert_eq!(store.pending_local_changes_count().await?, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod config;
pub mod core;
pub mod encryption;
pub mod error;
pub mod index;
pub mod journal;
pub mod resource;
pub mod sync;
pub mod types;

pub use crate::config::{DatabaseConfig, EngineConfig};
pub use crate::core::{Database, LocalChangeStore, ResourceStore, SyncStore};
pub use crate::error::{StorageError, StorageResult};
pub use crate::sync::SyncEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initializes a console tracing subscriber.
///
/// `RUST_LOG` overrides `level` when set.
#[cfg(feature = "logging")]
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_engine={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
