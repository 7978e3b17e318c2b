//! Engine configuration.
//!
//! Configuration is serde-deserializable (every field has a default) and can
//! also be read from the environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HELIOS_ENGINE_DB_PATH` | (in memory) | Database file |
//! | `HELIOS_ENGINE_DB_NAME` | helios-engine | Name the passphrase is stored under |
//! | `HELIOS_ENGINE_DB_MAX_CONNECTIONS` | 4 | Connection pool size |
//! | `HELIOS_ENGINE_DB_BUSY_TIMEOUT_MS` | 5000 | SQLite busy timeout |
//! | `HELIOS_ENGINE_DB_WAL` | true | WAL journal mode |
//! | `HELIOS_ENGINE_DB_ENCRYPTION` | false | Open with a SQLCipher key |
//! | `HELIOS_ENGINE_SYNC_RESOURCE_TYPES` | (none) | Comma-separated types to download |
//! | `HELIOS_ENGINE_SYNC_PAGE_SIZE` | (server) | `_count` for downloads |
//! | `HELIOS_ENGINE_UPLOAD_BATCH_SIZE` | 500 | Entries per bundle; 1 uploads per resource |
//! | `HELIOS_ENGINE_UPLOAD_CREATE_METHOD` | post | `post` or `put` |
//! | `HELIOS_ENGINE_UPLOAD_UPDATE_METHOD` | patch | `patch` or `put` |
//! | `HELIOS_ENGINE_SYNC_MAX_RETRIES` | 3 | Retries of transient failures |
//! | `HELIOS_ENGINE_SYNC_INITIAL_DELAY` | 500ms | First backoff delay |
//! | `HELIOS_ENGINE_SYNC_MAX_DELAY` | 30s | Backoff cap |
//!
//! # Example
//!
//! ```
//! use helios_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_env();
//! if let Err(errors) = config.validate() {
//!     for error in errors {
//!         eprintln!("config error: {error}");
//!     }
//! }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlite")]
use crate::backends::sqlite::SqliteBackendConfig;
use crate::sync::{CreateMethod, SyncConfig, UpdateMethod, UploadStrategy};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local database.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sync with the remote server.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Where and how the local database is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; `None` keeps the database in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Name the encryption passphrase is stored under.
    #[serde(default = "default_database_name")]
    pub name: String,

    /// SQLite settings.
    #[cfg(feature = "sqlite")]
    #[serde(default)]
    pub sqlite: SqliteBackendConfig,
}

fn default_database_name() -> String {
    "helios-engine".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: default_database_name(),
            #[cfg(feature = "sqlite")]
            sqlite: SqliteBackendConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// The path to open, `:memory:` for an in-memory database.
    pub fn location(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(":memory:"))
    }

    /// Returns true if the database lives in memory.
    pub fn is_memory(&self) -> bool {
        self.path.is_none()
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

impl EngineConfig {
    /// Reads the configuration from `HELIOS_ENGINE_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(&format!("HELIOS_ENGINE_{key}"));
        let mut config = Self::default();

        let database = &mut config.database;
        if let Some(path) = var("DB_PATH").filter(|p| !p.is_empty()) {
            database.path = Some(PathBuf::from(path));
        }
        if let Some(name) = var("DB_NAME") {
            database.name = name;
        }
        #[cfg(feature = "sqlite")]
        {
            let sqlite = &mut database.sqlite;
            sqlite.max_connections = var("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(sqlite.max_connections);
            sqlite.busy_timeout_ms = var("DB_BUSY_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(sqlite.busy_timeout_ms);
            sqlite.enable_wal = var("DB_WAL")
                .map(|v| parse_bool(&v))
                .unwrap_or(sqlite.enable_wal);
            sqlite.enable_encryption = var("DB_ENCRYPTION")
                .map(|v| parse_bool(&v))
                .unwrap_or(sqlite.enable_encryption);
        }

        let sync = &mut config.sync;
        if let Some(types) = var("SYNC_RESOURCE_TYPES") {
            sync.download.resource_types = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        sync.download.page_size = var("SYNC_PAGE_SIZE").and_then(|v| v.parse().ok());
        sync.upload.strategy = match var("UPLOAD_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            Some(1) => UploadStrategy::PerResource,
            Some(max_entries) => UploadStrategy::Bundle { max_entries },
            None => sync.upload.strategy,
        };
        sync.upload.create_method = match var("UPLOAD_CREATE_METHOD").as_deref() {
            Some("put") => CreateMethod::Put,
            Some("post") => CreateMethod::Post,
            _ => sync.upload.create_method,
        };
        sync.upload.update_method = match var("UPLOAD_UPDATE_METHOD").as_deref() {
            Some("put") => UpdateMethod::Put,
            Some("patch") => UpdateMethod::Patch,
            _ => sync.upload.update_method,
        };

        let retry = &mut sync.retry;
        retry.max_retries = var("SYNC_MAX_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(retry.max_retries);
        retry.initial_delay = var("SYNC_INITIAL_DELAY")
            .and_then(|v| humantime::parse_duration(&v).ok())
            .unwrap_or(retry.initial_delay);
        retry.max_delay = var("SYNC_MAX_DELAY")
            .and_then(|v| humantime::parse_duration(&v).ok())
            .unwrap_or(retry.max_delay);

        config
    }

    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.name.is_empty() {
            errors.push("Database name cannot be empty".to_string());
        }

        #[cfg(feature = "sqlite")]
        {
            let sqlite = &self.database.sqlite;
            if sqlite.max_connections == 0 {
                errors.push("Max connections cannot be 0".to_string());
            }
            if sqlite.enable_encryption && self.database.is_memory() {
                errors.push("Encryption requires a database file".to_string());
            }
        }

        if let UploadStrategy::Bundle { max_entries: 0 } = self.sync.upload.strategy {
            errors.push("Upload bundle size cannot be 0".to_string());
        }

        let retry = &self.sync.retry;
        if retry.backoff_multiplier < 1.0 {
            errors.push("Backoff multiplier cannot be below 1".to_string());
        }
        if retry.initial_delay > retry.max_delay {
            errors.push("Initial retry delay cannot exceed max delay".to_string());
        }

        if self
            .sync
            .download
            .resource_types
            .iter()
            .any(|t| !t.starts_with(|c: char| c.is_ascii_uppercase()))
        {
            errors.push("Resource types must start with an uppercase letter".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
