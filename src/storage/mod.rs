//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite, consumed through a narrow backend
//! wrapper. Shared DDL (the id-sequence table) lives in `schema`;
//! feature tables belong to their schema providers.

pub mod schema;
pub mod sqlite;

pub use sqlite::Database;
