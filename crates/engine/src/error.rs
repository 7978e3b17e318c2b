//! Error types for the engine.
//!
//! Local store errors ([`StorageError`]) always propagate to the caller of the
//! failing operation and roll back its transaction. Sync errors
//! ([`RemoteError`], [`ResourceSyncError`]) are reported per unit of work by the
//! sync engine instead of aborting a whole cycle.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::sync::Arc;

use thiserror::Error;

/// The primary error type for all store and journal operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Operations refused because of the current database state
    #[error(transparent)]
    State(#[from] StateError),

    /// Local change journal errors
    #[error(transparent)]
    LocalChange(#[from] LocalChangeError),

    /// Search operation errors
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StorageError {
    /// Returns true for [`ResourceError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Resource(ResourceError::NotFound { .. }))
    }

    /// Returns true for [`ResourceError::AlreadyExists`].
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Resource(ResourceError::AlreadyExists { .. })
        )
    }

    /// Returns true for any [`StateError`].
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, StorageError::State(_))
    }
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// A resource with the given ID already exists.
    #[error("resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// The resource body is missing required elements.
    #[error("invalid resource: {message}")]
    Invalid { message: String },
}

/// Operations refused because of the database state.
#[derive(Error, Debug)]
pub enum StateError {
    /// Purge without force while unsynced edits exist.
    #[error("{resource_type}/{id} has {count} pending local change(s); purge requires force")]
    PendingLocalChanges {
        resource_type: String,
        id: String,
        count: u64,
    },

    /// The database on disk does not match the requested encryption mode.
    #[error("database encryption mismatch: requested encrypted={requested}")]
    EncryptionMismatch { requested: bool },

    /// Encryption was requested but SQLCipher is not compiled in.
    #[error("database encryption requested but not supported by this build")]
    EncryptionUnsupported,

    /// No passphrase has been initialized for the named database.
    #[error("no passphrase available for database '{name}'")]
    PassphraseUnavailable { name: String },
}

/// Errors raised by the local change journal.
#[derive(Error, Debug)]
pub enum LocalChangeError {
    /// A change cannot follow the previous change for the same resource.
    #[error("invalid local change sequence for {resource_type}/{id}: {message}")]
    InvalidSequence {
        resource_type: String,
        id: String,
        message: String,
    },

    /// A stored patch could not be applied.
    #[error("failed to apply local change patch: {message}")]
    PatchFailed { message: String },

    /// The stored change type is not recognized.
    #[error("unknown local change type: {value}")]
    UnknownType { value: String },
}

/// Errors raised while building search queries.
#[derive(Error, Debug)]
pub enum SearchError {
    /// A filter cannot be translated to SQL.
    #[error("invalid filter on '{parameter}': {message}")]
    InvalidFilter { parameter: String, message: String },

    /// The sort family has no orderable value column.
    #[error("cannot sort by '{parameter}'")]
    UnsupportedSort { parameter: String },

    /// A query string cannot be translated into a search.
    #[error("invalid query '{query}': {message}")]
    InvalidQuery { query: String, message: String },
}

/// Backend-specific errors.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}

/// Failures reported by a remote data source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// I/O or availability failure; safe to retry.
    #[error("transient network failure: {message}")]
    TransientNetwork { message: String },

    /// The server refused the request (validation, auth, version conflict).
    #[error("server rejected request{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ServerRejected {
        status: Option<u16>,
        message: String,
    },
}

impl RemoteError {
    /// Creates a transient network error.
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::TransientNetwork {
            message: message.into(),
        }
    }

    /// Creates a server rejection.
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        RemoteError::ServerRejected {
            status,
            message: message.into(),
        }
    }

    /// Only transient network failures are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::TransientNetwork { .. })
    }
}

/// The cause of a failed unit of sync work.
#[derive(Error, Debug)]
pub enum SyncFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A sync failure scoped to one resource type.
///
/// Shared through [`Arc`] because the same failure is both broadcast as a
/// state transition and collected into the cycle result.
#[derive(Error, Debug, Clone)]
#[error("sync failed for {resource_type}: {cause}")]
pub struct ResourceSyncError {
    pub resource_type: String,
    #[source]
    pub cause: Arc<SyncFailure>,
}

impl ResourceSyncError {
    /// Wraps a failure for the given resource type.
    pub fn new(resource_type: impl Into<String>, cause: impl Into<SyncFailure>) -> Self {
        Self {
            resource_type: resource_type.into(),
            cause: Arc::new(cause.into()),
        }
    }

    /// Returns true if the cause can be retried in a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self.cause.as_ref(), SyncFailure::Remote(err) if err.is_retryable())
    }
}
