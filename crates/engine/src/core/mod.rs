//! Core store traits.
//!
//! - [`ResourceStore`] - resource CRUD, id reassignment, purge and search
//! - [`LocalChangeStore`] - reading, squashing and discarding the journal
//! - [`SyncStore`] - the primitives the sync engine drives
//! - [`Database`] - everything above, as one object-safe trait
//!
//! ```text
//! ResourceStore ─┐
//! LocalChangeStore ─┼── Database
//! SyncStore ─────┘
//! ```
//!
//! Every mutating operation runs in one database transaction covering both
//! the resource tables and the journal; a failure rolls back all of it.

mod local_changes;
mod storage;
mod sync;

pub use local_changes::LocalChangeStore;
pub use storage::ResourceStore;
pub use sync::SyncStore;

/// A complete engine database.
///
/// Implemented for every type that implements the three store traits, so a
/// backend only implements those. The sync engine holds an
/// `Arc<dyn Database>`.
pub trait Database: ResourceStore + LocalChangeStore + SyncStore {}

impl<T> Database for T where T: ResourceStore + LocalChangeStore + SyncStore {}
