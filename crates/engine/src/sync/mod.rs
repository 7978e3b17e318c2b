//! Download and upload between the local store and a remote server.
//!
//! # Download
//!
//! Each configured resource type is downloaded by its own task. Pages are
//! requested in `_lastUpdated` order starting from the type's checkpoint and
//! applied one page per transaction through
//! [`SyncStore::apply_remote_resources`](crate::core::SyncStore::apply_remote_resources).
//! A resource with pending local changes is a [`Conflict`], settled by the
//! engine's [`ConflictResolver`]. A failing type is reported and the others
//! continue.
//!
//! # Upload
//!
//! Pending changes are squashed per resource, ordered so referenced inserts
//! go first, and sent in batches per the [`UploadStrategy`]. Each accepted
//! entry is consolidated: a server-assigned id is adopted with reference
//! rewriting, the new version is stored and the uploaded records are
//! discarded. Rejected entries stay in the journal for the next cycle.
//!
//! | Change | Method |
//! |--------|--------|
//! | INSERT | `POST Type` or `PUT Type/id` ([`CreateMethod`]) |
//! | UPDATE | `PATCH Type/id` or `PUT Type/id` ([`UpdateMethod`]) |
//! | DELETE | `DELETE Type/id` |

mod config;
mod data_source;
mod download;
mod engine;
mod resolver;
mod retry;
mod state;
mod upload;

pub use config::{
    CreateMethod, DownloadConfig, SyncConfig, UpdateMethod, UploadConfig, UploadStrategy,
};
pub use data_source::{
    DataSource, DownloadRequest, DownloadResponse, EntryOutcome, UploadAck, UploadEntry,
    UploadMethod, UploadRequest, UploadResponse,
};
pub use engine::SyncEngine;
pub use resolver::{AcceptLocal, AcceptRemote, Conflict, ConflictResolution, ConflictResolver};
pub use retry::RetryConfig;
pub use state::{DownloadState, SyncResult, SyncState, UploadProgress, UploadState};
