//! Resource store trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;
use crate::types::{ResourceRecord, Search};

/// Resource CRUD with journaling.
///
/// Local mutations (`insert_local`, `update`, `delete`) append to the local
/// change journal in the same transaction. Remote writes (`insert_remote`)
/// do not.
///
/// # Example
///
/// ```no_run
/// use helios_engine::backends::sqlite::SqliteBackend;
/// use helios_engine::core::{LocalChangeStore, ResourceStore};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteBackend::in_memory()?;
///
/// let ids = store
///     .insert_local(vec![json!({"resourceType": "Patient", "id": "p1", "gender": "male"})])
///     .await?;
/// assert_eq!(ids, vec!["p1"]);
///
/// store
///     .update(json!({"resourceType": "Patient", "id": "p1", "gender": "female"}))
///     .await?;
///
/// let changes = store.get_local_changes("Patient", "p1").await?;
/// assert_eq!(changes.len(), 2);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Inserts locally created resources and journals an INSERT for each.
    ///
    /// Resources without an `id` get a generated one. All resources are
    /// written in one transaction.
    ///
    /// # Returns
    ///
    /// The logical id of every resource, in input order.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(AlreadyExists)` - If `(type, id)` is taken
    /// * `StorageError::Resource(Invalid)` - If a body has no `resourceType`
    async fn insert_local(&self, resources: Vec<Value>) -> StorageResult<Vec<String>>;

    /// Inserts or overwrites resources received from the server.
    ///
    /// Version markers are read from `meta`. Nothing is journaled.
    async fn insert_remote(&self, resources: Vec<Value>) -> StorageResult<()>;

    /// Replaces a resource body and journals the JSON patch from the old
    /// body. An identical body records nothing.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If `(type, id)` does not exist
    async fn update(&self, resource: Value) -> StorageResult<()>;

    /// Deletes a resource and its index rows and journals a DELETE carrying
    /// the last known remote version. Deleting an absent resource is a no-op.
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()>;

    /// Reads a resource body.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If `(type, id)` does not exist
    async fn get(&self, resource_type: &str, id: &str) -> StorageResult<Value>;

    /// Reads a resource with its uuid and sync markers.
    async fn get_record(&self, resource_type: &str, id: &str) -> StorageResult<ResourceRecord>;

    /// Gives a resource a new logical id and rewrites every reference to it.
    ///
    /// `new_resource` carries the new id. The resource row, its index rows,
    /// its journal entries, every resource found through the reference index
    /// pointing at `Type/old_id`, and those resources' journal entries are
    /// rewritten in one transaction.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If `(type, old_id)` does not exist
    /// * `StorageError::Resource(AlreadyExists)` - If the new id is taken
    async fn update_resource_id_and_references(
        &self,
        old_id: &str,
        new_resource: Value,
    ) -> StorageResult<()>;

    /// Hard-deletes a resource and its journal entries.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If `(type, id)` does not exist
    /// * `StorageError::State(PendingLocalChanges)` - If unsynced changes
    ///   exist and `force` is false
    async fn purge(&self, resource_type: &str, id: &str, force: bool) -> StorageResult<()>;

    /// Returns the resources matching `search`.
    async fn search(&self, search: &Search) -> StorageResult<Vec<ResourceRecord>>;

    /// Counts the resources matching `search`, ignoring sort and paging.
    async fn count(&self, search: &Search) -> StorageResult<u64>;

    /// Removes every resource, index entry, journal entry and download
    /// checkpoint, leaving an empty store with its schema in place.
    ///
    /// Pending local changes are discarded without upload.
    async fn clear_database(&self) -> StorageResult<()>;
}
