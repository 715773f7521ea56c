//! SQLite backend wrapper
//!
//! The narrow interface the store consumes from the storage engine:
//! statement execution, row-returning queries, begin/commit/rollback,
//! schema-version and pragma control. Everything above this layer is
//! engine-agnostic.

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::config::StoreConfig;
use crate::Result;

/// Handle on the underlying SQLite database.
///
/// The connection is not shared between threads directly; the owning
/// service keeps it behind a mutex. Exactly one backend transaction is
/// open at a time (single-writer discipline).
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database file (creates if it doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    // ========== Statements ==========

    /// Execute a single statement, returning the affected row count
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Execute a batch of statements (DDL, pragmas)
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Execute an INSERT and return the new rowid
    pub fn insert<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<i64> {
        self.conn.execute(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    // ========== Queries ==========

    /// Run a query expected to return at most one row
    pub fn query_row_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f).optional()?)
    }

    /// Run a query and map every row
    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, f)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Run a single-value integer query. A missing row and a NULL value
    /// both map to `None`.
    pub fn long_query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<i64>> {
        let value: Option<Option<i64>> = self
            .conn
            .query_row(sql, params, |row| row.get::<_, Option<i64>>(0))
            .optional()?;
        Ok(value.flatten())
    }

    /// Whether a table exists in the current schema
    pub fn has_table(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether a column exists on a table (used by upgrade guards)
    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names.iter().any(|n| n == column))
    }

    // ========== Transactions ==========

    /// Begin the backend transaction. The write lock is taken up front
    /// so a later write cannot fail with SQLITE_BUSY mid-transaction.
    pub fn begin(&self) -> Result<()> {
        self.execute_batch("BEGIN IMMEDIATE")
    }

    /// Commit the backend transaction
    pub fn commit(&self) -> Result<()> {
        self.execute_batch("COMMIT")
    }

    /// Roll back the backend transaction
    pub fn rollback(&self) -> Result<()> {
        self.execute_batch("ROLLBACK")
    }

    /// Whether a backend transaction is currently open
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    // ========== Schema version & pragmas ==========

    /// Read the persisted schema version (`PRAGMA user_version`)
    pub fn schema_version(&self) -> Result<i32> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Persist the schema version
    pub fn set_schema_version(&self, version: i32) -> Result<()> {
        self.execute_batch(&format!("PRAGMA user_version = {}", version))
    }

    /// Apply connection pragmas from the configuration: write-ahead log
    /// journal, checkpoint threshold, secure delete.
    pub fn configure(&self, config: &StoreConfig) -> Result<()> {
        // journal_mode returns the resulting mode as a row
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!("journal mode: {}", mode);
        self.execute_batch(&format!(
            "PRAGMA wal_autocheckpoint = {}",
            config.wal_autocheckpoint
        ))?;
        self.execute_batch(&format!(
            "PRAGMA secure_delete = {}",
            if config.secure_delete { "ON" } else { "OFF" }
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        db
    }

    #[test]
    fn test_insert_returns_rowid() {
        let db = test_db();
        let id = db
            .insert("INSERT INTO t (name) VALUES (?1)", params!["a"])
            .unwrap();
        assert_eq!(id, 1);
        let id = db
            .insert("INSERT INTO t (name) VALUES (?1)", params!["b"])
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_long_query_flattens_null_and_missing() {
        let db = test_db();
        // empty table: MAX is a NULL row
        let max = db.long_query("SELECT MAX(id) FROM t", []).unwrap();
        assert!(max.is_none());
        // no row at all
        let missing = db
            .long_query("SELECT id FROM t WHERE name = 'nope'", [])
            .unwrap();
        assert!(missing.is_none());

        db.insert("INSERT INTO t (name) VALUES ('a')", []).unwrap();
        let max = db.long_query("SELECT MAX(id) FROM t", []).unwrap();
        assert_eq!(max, Some(1));
    }

    #[test]
    fn test_has_table_and_column() {
        let db = test_db();
        assert!(db.has_table("t").unwrap());
        assert!(!db.has_table("missing").unwrap());
        assert!(db.has_column("t", "name").unwrap());
        assert!(!db.has_column("t", "missing").unwrap());
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let db = test_db();
        db.begin().unwrap();
        assert!(db.in_transaction());
        db.execute("INSERT INTO t (name) VALUES ('x')", []).unwrap();
        db.rollback().unwrap();
        assert!(!db.in_transaction());
        let count = db.long_query("SELECT COUNT(*) FROM t", []).unwrap();
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_schema_version_roundtrip() {
        let db = test_db();
        assert_eq!(db.schema_version().unwrap(), 0);
        db.set_schema_version(21).unwrap();
        assert_eq!(db.schema_version().unwrap(), 21);
    }
}
