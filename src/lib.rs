//! # Twinstore - Client-side transactional object store
//!
//! Persistence engine for a twincode-based secure-messaging SDK.
//!
//! Twinstore provides:
//! - Process-wide identity cache: at most one live instance per entity id,
//!   with secondary lookup by UUID
//! - Crash-safe batched numeric-id allocation backed by a persisted
//!   sequence table
//! - Scoped transactions with rollback-on-drop and cascading-delete
//!   dispatch to optional cleaner capabilities
//! - Versioned, resumable schema migration driven by per-feature providers
//! - SQLite-backed storage (rusqlite) behind a narrow backend wrapper
//!
//! The store is synchronous and single-writer: a coarse re-entrant lock
//! serializes transactions while read-only queries may bypass it.

pub mod allocator;
pub mod cache;
pub mod cleaner;
pub mod config;
pub mod conversation;
pub mod entity;
pub mod factory;
pub mod image;
pub mod migration;
pub mod notification;
pub mod report;
pub mod repository;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod twincode;

// Re-exports for convenient access
pub use cache::IdentityCache;
pub use cleaner::{
    CleanerRegistry, ConversationsCleaner, ImagesCleaner, NotificationsCleaner, TwincodesCleaner,
};
pub use config::StoreConfig;
pub use entity::{AttributeMap, AttributeValue, EntityId, EntityKind, PersistedEntity};
pub use factory::ObjectFactory;
pub use migration::{SchemaProvider, SchemaRegistry, SCHEMA_VERSION};
pub use storage::Database;
pub use store::ObjectStore;
pub use transaction::Transaction;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Failure type for every store operation.
///
/// SQLite failures are classified so upstream code can react
/// differently: disk-full is retryable (callers run their own space
/// reclaim), corruption is fatal and surfaced without repair attempts.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("disk full: {0}")]
    DiskFull(#[source] rusqlite::Error),

    #[error("disk I/O error: {0}")]
    Io(#[source] rusqlite::Error),

    #[error("database corruption: {0}")]
    Corruption(#[source] rusqlite::Error),

    #[error("constraint violation: {0}")]
    Constraint(#[source] rusqlite::Error),

    #[error("storage error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("no id sequence for entity kind {0}")]
    NoSequence(EntityKind),

    #[error("unknown entity kind: {0}")]
    InvalidKind(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    File(#[from] std::io::Error),

    #[error("database schema version {found} is newer than supported version {supported}")]
    VersionTooNew { found: i32, supported: i32 },
}

impl StorageError {
    /// Whether the failure is SQLITE_FULL - retryable once space is reclaimed
    pub fn is_disk_full(&self) -> bool {
        matches!(self, StorageError::DiskFull(_))
    }

    /// Whether the failure is a disk I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }

    /// Whether the database is corrupt - fatal, no automatic repair
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            return match code.code {
                rusqlite::ErrorCode::DiskFull => StorageError::DiskFull(err),
                rusqlite::ErrorCode::SystemIoFailure => StorageError::Io(err),
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageError::Corruption(err)
                }
                rusqlite::ErrorCode::ConstraintViolation => StorageError::Constraint(err),
                _ => StorageError::Sqlite(err),
            };
        }
        StorageError::Sqlite(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: rusqlite::ErrorCode) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: code as i32,
            },
            None,
        )
    }

    #[test]
    fn test_disk_full_classification() {
        let err: StorageError = sqlite_failure(rusqlite::ErrorCode::DiskFull).into();
        assert!(err.is_disk_full());
        assert!(!err.is_io_error());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_corruption_classification() {
        let err: StorageError = sqlite_failure(rusqlite::ErrorCode::DatabaseCorrupt).into();
        assert!(err.is_corruption());
        let err: StorageError = sqlite_failure(rusqlite::ErrorCode::NotADatabase).into();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_other_sqlite_errors_pass_through() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StorageError::Sqlite(_)));
        assert!(!err.is_disk_full());
    }
}
