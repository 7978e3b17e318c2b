//! Sync state transitions broadcast to subscribers.

use crate::error::ResourceSyncError;

/// Progress of one resource type's download.
///
/// Per type: `Started`, then `Requesting` and `Success` for each page,
/// or a final `Failure`.
#[derive(Debug, Clone)]
pub enum DownloadState {
    /// The type's download began.
    Started { resource_type: String },
    /// A page is being fetched.
    Requesting { resource_type: String, url: String },
    /// A page was applied.
    Success {
        resource_type: String,
        /// Resources applied from this page.
        count: usize,
        next_url: Option<String>,
    },
    /// The type's download stopped; pages already applied stay applied.
    Failure(ResourceSyncError),
}

/// Upload progress after a batch.
#[derive(Debug, Clone, Default)]
pub struct UploadProgress {
    /// Changes not yet attempted in this cycle.
    pub pending: usize,
    /// Changes this cycle started with.
    pub total: usize,
    /// The most recent failure, if any.
    pub last_error: Option<ResourceSyncError>,
}

/// Progress of the upload flow.
#[derive(Debug, Clone)]
pub enum UploadState {
    /// Squashed changes are about to be uploaded.
    Started { total: usize },
    /// A batch finished.
    Progress(UploadProgress),
    /// One change failed and stays pending.
    Failure(ResourceSyncError),
}

/// A state transition of the sync engine.
#[derive(Debug, Clone)]
pub enum SyncState {
    /// Download flow transition.
    Download(DownloadState),
    /// Upload flow transition.
    Upload(UploadState),
    /// A cycle finished.
    Idle,
}

/// Outcome of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Resources applied from the server.
    pub downloaded: usize,
    /// Local changes the server accepted.
    pub uploaded: usize,
    /// Every per-unit failure. Nothing here was discarded locally.
    pub failures: Vec<ResourceSyncError>,
    /// Whether the cycle stopped early.
    pub cancelled: bool,
}

impl SyncResult {
    /// True when nothing failed and the cycle ran to completion.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}
