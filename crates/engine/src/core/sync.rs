//! Store primitives driven by the sync engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StorageResult;
use crate::sync::{ConflictResolver, UploadAck};
use crate::types::SquashedLocalChange;

/// Atomic units of work used by download and upload.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Applies one downloaded page in a single transaction.
    ///
    /// Resources without pending local changes are written as by
    /// [`insert_remote`](super::ResourceStore::insert_remote). For the rest
    /// `resolver` decides: accepting the remote side overwrites the body and
    /// drops the pending changes; accepting the local side keeps the body and
    /// re-bases the pending changes onto the remote version as one record.
    /// The download checkpoint of each resource type advances to the newest
    /// `meta.lastUpdated` on the page.
    ///
    /// # Returns
    ///
    /// The number of resources applied.
    async fn apply_remote_resources(
        &self,
        resources: Vec<Value>,
        resolver: &dyn ConflictResolver,
    ) -> StorageResult<usize>;

    /// The download checkpoint of a resource type.
    async fn last_update(&self, resource_type: &str) -> StorageResult<Option<DateTime<Utc>>>;

    /// Stores the server's version markers for a resource.
    async fn update_version_and_last_updated(
        &self,
        resource_type: &str,
        id: &str,
        version_id: Option<&str>,
        last_updated: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Records an accepted upload in one transaction: adopts a server-assigned
    /// id (with reference rewriting), stores the acknowledged version, and
    /// discards the uploaded change records.
    async fn consolidate_upload(
        &self,
        squashed: &SquashedLocalChange,
        ack: &UploadAck,
    ) -> StorageResult<()>;
}
