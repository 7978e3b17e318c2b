//! Database passphrases.
//!
//! The backend asks a [`PassphraseProvider`] for the key of a named
//! database when it opens an encrypted file. [`PassphraseCache`] is the
//! bundled provider: an explicitly initialized, explicitly cleared map held
//! by whoever owns the engine, never a global.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{StateError, StorageResult};

/// Supplies the key of an encrypted database.
pub trait PassphraseProvider: Send + Sync {
    /// Returns the passphrase for `database_name`.
    ///
    /// # Errors
    ///
    /// * `StorageError::State(PassphraseUnavailable)` - If none is known
    fn passphrase(&self, database_name: &str) -> StorageResult<String>;
}

/// In-process passphrase cache.
///
/// ```
/// use helios_engine::encryption::{PassphraseCache, PassphraseProvider};
///
/// let cache = PassphraseCache::new();
/// cache.init("resources", "s3cret");
/// assert_eq!(cache.passphrase("resources").unwrap(), "s3cret");
///
/// cache.clear();
/// assert!(cache.passphrase("resources").is_err());
/// ```
#[derive(Debug, Default)]
pub struct PassphraseCache {
    passphrases: RwLock<HashMap<String, String>>,
}

impl PassphraseCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the passphrase of `database_name`, replacing any previous one.
    pub fn init(&self, database_name: impl Into<String>, passphrase: impl Into<String>) {
        self.passphrases
            .write()
            .insert(database_name.into(), passphrase.into());
    }

    /// Forgets the passphrase of one database.
    pub fn remove(&self, database_name: &str) {
        self.passphrases.write().remove(database_name);
    }

    /// Forgets every passphrase.
    pub fn clear(&self) {
        self.passphrases.write().clear();
    }

    /// Returns true if a passphrase is cached for `database_name`.
    pub fn contains(&self, database_name: &str) -> bool {
        self.passphrases.read().contains_key(database_name)
    }
}

impl PassphraseProvider for PassphraseCache {
    fn passphrase(&self, database_name: &str) -> StorageResult<String> {
        self.passphrases
            .read()
            .get(database_name)
            .cloned()
            .ok_or_else(|| {
                StateError::PassphraseUnavailable {
                    name: database_name.to_string(),
                }
                .into()
            })
    }
}
