//! Database backend implementations.
//!
//! Each backend implements [`ResourceStore`](crate::core::ResourceStore),
//! [`LocalChangeStore`](crate::core::LocalChangeStore) and
//! [`SyncStore`](crate::core::SyncStore) and is gated behind a feature flag.
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | SQLite | `sqlite` | Embedded database, the default |
//! | SQLCipher | `sqlcipher` | SQLite with at-rest encryption |

#[cfg(feature = "sqlite")]
pub mod sqlite;
