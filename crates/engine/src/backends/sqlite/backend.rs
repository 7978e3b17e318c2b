//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::encryption::PassphraseProvider;
use crate::error::{BackendError, StateError, StorageError, StorageResult};
use crate::index::{ResourceIndexer, SearchParamIndexer};
use crate::resource::{JsonResourceCodec, ResourceCodec};

use super::schema;

/// SQLite backend for the resource store and local change journal.
///
/// In-memory databases use a single pooled connection, since every SQLite
/// `:memory:` connection is its own database.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteBackendConfig,
    is_memory: bool,
    pub(crate) indexer: Arc<dyn ResourceIndexer>,
    pub(crate) codec: Arc<dyn ResourceCodec>,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Maximum number of connections in the pool (forced to 1 in memory).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Open the database with a SQLCipher key.
    #[serde(default)]
    pub enable_encryption: bool,
}

fn default_max_connections() -> u32 {
    4
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            enable_encryption: false,
        }
    }
}

/// Settings applied to every pooled connection as it is opened.
#[derive(Clone)]
struct ConnectionInit {
    passphrase: Option<String>,
    busy_timeout: Duration,
    enable_wal: bool,
}

impl ConnectionInit {
    fn apply(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        // The key must be set before anything reads the file
        if let Some(passphrase) = &self.passphrase {
            conn.pragma_update(None, "key", passphrase)?;
        }
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if self.enable_wal {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
        }
        Ok(())
    }
}

fn connection_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::ConnectionFailed {
        backend_name: "sqlite".to_string(),
        message,
    })
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteBackendConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, SqliteBackendConfig::default())
    }

    /// Creates an unencrypted backend with custom configuration.
    ///
    /// # Errors
    ///
    /// * `StorageError::State(PassphraseUnavailable)` - If the configuration
    ///   asks for encryption; use [`SqliteBackend::open_encrypted`]
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteBackendConfig) -> StorageResult<Self> {
        if config.enable_encryption {
            return Err(StateError::PassphraseUnavailable {
                name: path.as_ref().to_string_lossy().into_owned(),
            }
            .into());
        }
        Self::build(path.as_ref(), config, None)
    }

    /// Opens an encrypted database, fetching its key from `provider` under
    /// `database_name`.
    ///
    /// # Errors
    ///
    /// * `StorageError::State(EncryptionUnsupported)` - Without SQLCipher
    /// * `StorageError::State(EncryptionMismatch)` - If the file is not
    ///   encrypted with that key
    pub fn open_encrypted<P: AsRef<Path>>(
        path: P,
        database_name: &str,
        mut config: SqliteBackendConfig,
        provider: &dyn PassphraseProvider,
    ) -> StorageResult<Self> {
        config.enable_encryption = true;
        let passphrase = provider.passphrase(database_name)?;
        Self::build(path.as_ref(), config, Some(passphrase))
    }

    /// Opens the database described by an engine [`DatabaseConfig`].
    ///
    /// `provider` is consulted only when encryption is enabled.
    pub fn from_config(
        config: &DatabaseConfig,
        provider: Option<&dyn PassphraseProvider>,
    ) -> StorageResult<Self> {
        let path = config.location();
        match (config.sqlite.enable_encryption, provider) {
            (true, Some(provider)) => {
                Self::open_encrypted(&path, &config.name, config.sqlite.clone(), provider)
            }
            (true, None) => Err(StateError::PassphraseUnavailable {
                name: config.name.clone(),
            }
            .into()),
            (false, _) => Self::with_config(&path, config.sqlite.clone()),
        }
    }

    fn build(path: &Path, config: SqliteBackendConfig, passphrase: Option<String>) -> StorageResult<Self> {
        let is_memory = path.to_string_lossy() == ":memory:";

        Self::verify_encryption(path, is_memory, passphrase.as_deref())?;

        let init = ConnectionInit {
            passphrase,
            busy_timeout: Duration::from_millis(u64::from(config.busy_timeout_ms)),
            enable_wal: config.enable_wal && !is_memory,
        };
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path)
        }
        .with_init(move |conn| init.apply(conn));

        let builder = Pool::builder()
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms));
        let builder = if is_memory {
            // One connection for the life of the pool
            builder
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            builder.max_size(config.max_connections.max(1))
        };
        let pool = builder
            .build(manager)
            .map_err(|e| connection_error(e.to_string()))?;

        let backend = Self {
            pool,
            config,
            is_memory,
            indexer: Arc::new(SearchParamIndexer::with_defaults()),
            codec: Arc::new(JsonResourceCodec),
        };
        backend.init_schema()?;

        tracing::debug!(
            path = %path.display(),
            encrypted = backend.config.enable_encryption,
            "Opened SQLite database"
        );
        Ok(backend)
    }

    /// Checks the requested encryption mode against the file on disk.
    fn verify_encryption(path: &Path, is_memory: bool, passphrase: Option<&str>) -> StorageResult<()> {
        let conn = if is_memory {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| connection_error(e.to_string()))?;

        if let Some(passphrase) = passphrase {
            let cipher_version: Option<String> = conn
                .query_row("PRAGMA cipher_version", [], |row| row.get(0))
                .optional()?;
            if cipher_version.is_none() {
                return Err(StateError::EncryptionUnsupported.into());
            }
            conn.pragma_update(None, "key", passphrase)?;
        }

        match conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::NotADatabase => {
                Err(StateError::EncryptionMismatch {
                    requested: passphrase.is_some(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the indexing function.
    ///
    /// Existing index rows are not rebuilt; set this before storing data.
    pub fn with_indexer(mut self, indexer: impl ResourceIndexer + 'static) -> Self {
        self.indexer = Arc::new(indexer);
        self
    }

    /// Replaces the resource codec.
    pub fn with_codec(mut self, codec: impl ResourceCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Initialize the database schema. Safe to call more than once.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| connection_error(e.to_string()))
    }

    /// Runs `f` in an IMMEDIATE transaction, committing on success.
    ///
    /// Dropping the transaction on error rolls everything back.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }

    /// Checks that a connection can run a query.
    pub fn health_check(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::PassphraseCache;

    #[test]
    fn test_in_memory_backend() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(backend.is_memory());
        backend.init_schema().unwrap();
        backend.health_check().unwrap();
    }

    #[test]
    fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let backend = SqliteBackend::open(&path).unwrap();
        assert!(!backend.is_memory());
        drop(backend);

        // Reopening runs no migrations and keeps the schema
        let backend = SqliteBackend::open(&path).unwrap();
        let conn = backend.get_connection().unwrap();
        assert_eq!(
            schema::get_schema_version(&conn).unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let backend = SqliteBackend::in_memory().unwrap();
        let result: StorageResult<()> = backend.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO synced_resources (resource_type, last_update) VALUES ('Patient', 'x')",
                [],
            )?;
            Err(StateError::EncryptionUnsupported.into())
        });
        assert!(result.is_err());

        let conn = backend.get_connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM synced_resources", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_encryption_requires_passphrase() {
        let mut config = SqliteBackendConfig::default();
        config.enable_encryption = true;
        let err = SqliteBackend::with_config(":memory:", config.clone()).unwrap_err();
        assert!(err.is_illegal_state());

        let cache = PassphraseCache::new();
        let err = SqliteBackend::open_encrypted(":memory:", "db", config, &cache).unwrap_err();
        assert!(matches!(
            err,
            StorageError::State(StateError::PassphraseUnavailable { .. })
        ));
    }

    #[cfg(not(feature = "sqlcipher"))]
    #[test]
    fn test_encryption_unsupported_without_sqlcipher() {
        let cache = PassphraseCache::new();
        cache.init("db", "secret");
        let err = SqliteBackend::open_encrypted(
            ":memory:",
            "db",
            SqliteBackendConfig::default(),
            &cache,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::State(StateError::EncryptionUnsupported)
        ));
    }

    #[cfg(feature = "sqlcipher")]
    #[test]
    fn test_encryption_mode_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        drop(SqliteBackend::open(&path).unwrap());

        let cache = PassphraseCache::new();
        cache.init("db", "secret");
        let err =
            SqliteBackend::open_encrypted(&path, "db", SqliteBackendConfig::default(), &cache)
                .unwrap_err();
        assert!(matches!(
            err,
            StorageError::State(StateError::EncryptionMismatch { requested: true })
        ));
    }
}
