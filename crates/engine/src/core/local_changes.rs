//! Local change journal trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::types::{LocalChange, LocalChangeToken, SquashedLocalChange};

/// Read and maintenance access to the local change journal.
///
/// Records are only ever appended by [`ResourceStore`](super::ResourceStore)
/// mutations. Discarding is explicit and by id, so a record the server has
/// not confirmed is never removed.
#[async_trait]
pub trait LocalChangeStore: Send + Sync {
    /// Pending changes of one resource, oldest first.
    async fn get_local_changes(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<LocalChange>>;

    /// Every pending change, oldest first.
    async fn get_all_local_changes(&self) -> StorageResult<Vec<LocalChange>>;

    /// Number of pending change records.
    async fn pending_local_changes_count(&self) -> StorageResult<u64>;

    /// One squashed change per resource, ordered by each resource's oldest
    /// pending change.
    async fn squashed_local_changes(&self) -> StorageResult<Vec<SquashedLocalChange>>;

    /// All pending changes of the resource that has waited longest.
    ///
    /// Empty when nothing is pending.
    async fn earliest_pending_group(&self) -> StorageResult<Vec<LocalChange>>;

    /// Replaces a resource's pending changes with their squashed equivalent.
    ///
    /// Returns the stored record, or `None` if nothing was pending.
    async fn squash_local_changes(&self, resource_uuid: Uuid) -> StorageResult<Option<LocalChange>>;

    /// Removes the records named by `token`.
    async fn discard_local_changes(&self, token: &LocalChangeToken) -> StorageResult<()>;

    /// Removes every pending change of one resource.
    async fn discard_resource_local_changes(&self, resource_type: &str, id: &str)
    -> StorageResult<()>;
}
