//! The sync engine.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::Database;
use crate::error::{BackendError, ResourceSyncError, StorageError};
use crate::resource::{JsonResourceCodec, ResourceCodec};

use super::config::SyncConfig;
use super::data_source::DataSource;
use super::download::DownloadContext;
use super::resolver::{AcceptRemote, ConflictResolver};
use super::state::{DownloadState, SyncResult, SyncState};
use super::upload::UploadContext;

const STATE_CHANNEL_CAPACITY: usize = 256;

/// Drives download and upload between a [`Database`] and a [`DataSource`].
///
/// Subscribers see every state transition through [`subscribe`](Self::subscribe).
/// A running cycle is stopped with [`cancel`](Self::cancel): no new request
/// is issued, and the transaction in progress completes.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use helios_engine::backends::sqlite::SqliteBackend;
/// use helios_engine::sync::{AcceptLocal, DataSource, SyncConfig, SyncEngine};
///
/// # async fn example(source: Arc<dyn DataSource>) -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(SqliteBackend::open("./data/engine.db")?);
/// let mut config = SyncConfig::default();
/// config.download.resource_types = vec!["Patient".into(), "Observation".into()];
///
/// let engine = SyncEngine::new(store, source, config).with_resolver(AcceptLocal);
/// let mut states = engine.subscribe();
/// tokio::spawn(async move {
///     while let Ok(state) = states.recv().await {
///         println!("{state:?}");
///     }
/// });
///
/// let result = engine.sync().await;
/// println!("downloaded {}, uploaded {}", result.downloaded, result.uploaded);
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    store: Arc<dyn Database>,
    source: Arc<dyn DataSource>,
    resolver: Arc<dyn ConflictResolver>,
    codec: Arc<dyn ResourceCodec>,
    config: SyncConfig,
    states: broadcast::Sender<SyncState>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine that resolves conflicts with [`AcceptRemote`].
    pub fn new(store: Arc<dyn Database>, source: Arc<dyn DataSource>, config: SyncConfig) -> Self {
        let (states, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            store,
            source,
            resolver: Arc::new(AcceptRemote),
            codec: Arc::new(JsonResourceCodec),
            config,
            states,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Sets the codec used to find references when ordering uploads.
    pub fn with_codec(mut self, codec: impl ResourceCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncState> {
        self.states.subscribe()
    }

    /// Cancels the running cycle, if any.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    fn start_cycle(&self) -> CancellationToken {
        let mut current = self.cancel.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }

    /// Runs one download pass then one upload pass.
    pub async fn sync(&self) -> SyncResult {
        let cancel = self.start_cycle();
        tracing::info!("Sync cycle started");

        let mut result = SyncResult::default();
        self.download_with(&cancel, &mut result).await;
        if !cancel.is_cancelled() {
            self.upload_with(&cancel, &mut result).await;
        }
        result.cancelled = cancel.is_cancelled();

        let _ = self.states.send(SyncState::Idle);
        tracing::info!(
            downloaded = result.downloaded,
            uploaded = result.uploaded,
            failures = result.failures.len(),
            cancelled = result.cancelled,
            "Sync cycle finished"
        );
        result
    }

    /// Runs only the download pass.
    pub async fn download(&self) -> SyncResult {
        let cancel = self.start_cycle();
        let mut result = SyncResult::default();
        self.download_with(&cancel, &mut result).await;
        result.cancelled = cancel.is_cancelled();
        let _ = self.states.send(SyncState::Idle);
        result
    }

    /// Runs only the upload pass.
    pub async fn upload(&self) -> SyncResult {
        let cancel = self.start_cycle();
        let mut result = SyncResult::default();
        self.upload_with(&cancel, &mut result).await;
        result.cancelled = cancel.is_cancelled();
        let _ = self.states.send(SyncState::Idle);
        result
    }

    /// Downloads every configured type concurrently.
    async fn download_with(&self, cancel: &CancellationToken, result: &mut SyncResult) {
        let context = DownloadContext {
            store: self.store.clone(),
            source: self.source.clone(),
            resolver: self.resolver.clone(),
            retry: self.config.retry.clone(),
            cancel: cancel.clone(),
            states: self.states.clone(),
        };

        let mut tasks = JoinSet::new();
        for resource_type in &self.config.download.resource_types {
            let context = context.clone();
            let resource_type = resource_type.clone();
            let params = self.config.download.params.get(&resource_type).cloned();
            let page_size = self.config.download.page_size;
            tasks.spawn(async move {
                let outcome = context
                    .download_type(resource_type.clone(), params, page_size)
                    .await;
                (resource_type, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(count))) => result.downloaded += count,
                Ok((resource_type, Err(error))) => {
                    tracing::warn!(resource_type = %resource_type, error = %error, "Download failed");
                    let _ = self
                        .states
                        .send(SyncState::Download(DownloadState::Failure(error.clone())));
                    result.failures.push(error);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Download task panicked");
                    result.failures.push(ResourceSyncError::new(
                        "*",
                        StorageError::Backend(BackendError::Internal {
                            backend_name: self.store.backend_name().to_string(),
                            message: format!("download task failed: {e}"),
                            source: None,
                        }),
                    ));
                }
            }
        }
    }

    async fn upload_with(&self, cancel: &CancellationToken, result: &mut SyncResult) {
        let context = UploadContext {
            store: &self.store,
            source: &self.source,
            codec: self.codec.as_ref(),
            config: &self.config.upload,
            retry: &self.config.retry,
            cancel,
            states: &self.states,
        };
        let summary = context.run().await;
        result.uploaded += summary.uploaded;
        result.failures.extend(summary.failures);
    }
}
