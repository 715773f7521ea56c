//! Transactions - scoped units of work
//!
//! A transaction serializes all mutation behind the service-wide
//! re-entrant lock, lazily begins the backend transaction on the first
//! mutating call, and always terminates: `commit` consumes the scope,
//! and dropping an uncommitted scope rolls back - on every exit path,
//! including panics and early returns.
//!
//! Rollback safety for id allocation needs no per-allocation undo log:
//! every allocator touched during the scope is reset to its
//! unreconciled state, forcing a full reconciliation on next use by any
//! future transaction.

use parking_lot::ReentrantMutexGuard;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::Arc;

use crate::entity::{EntityId, EntityKind};
use crate::store::ObjectStore;
use crate::twincode::TwincodeOutbound;
use crate::{Result, StorageError};

/// A scoped unit of work over the store.
///
/// Created per operation and never outlives the scope that created it.
/// Holding one excludes every other writer; read-only queries on the
/// store may still run concurrently.
pub struct Transaction<'s> {
    store: &'s ObjectStore,
    _guard: ReentrantMutexGuard<'s, ()>,
    /// Backend transaction begun (by us or an enclosing scope)
    active: Cell<bool>,
    /// We issued the BEGIN and own commit/rollback
    owns: Cell<bool>,
    /// Terminal: commit or rollback already ran
    finished: Cell<bool>,
    /// Kinds whose allocators handed out ids during this scope
    touched: RefCell<HashSet<EntityKind>>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s ObjectStore) -> Self {
        let guard = store.service_lock().lock();
        Self {
            store,
            _guard: guard,
            active: Cell::new(false),
            owns: Cell::new(false),
            finished: Cell::new(false),
            touched: RefCell::new(HashSet::new()),
        }
    }

    /// The owning store
    pub fn store(&self) -> &'s ObjectStore {
        self.store
    }

    /// Begin the backend transaction if not already begun. Idempotent;
    /// called lazily by every mutating helper, so pure reads never
    /// force a transaction. A scope opened while the connection is
    /// already inside a transaction (re-entrant use on the same
    /// thread) folds into the enclosing one and does not own
    /// commit/rollback.
    pub fn start(&self) -> Result<()> {
        if self.active.get() {
            return Ok(());
        }
        let db = self.store.db();
        if db.in_transaction() {
            self.owns.set(false);
        } else {
            db.begin()?;
            self.owns.set(true);
        }
        self.active.set(true);
        Ok(())
    }

    /// Whether a backend transaction has been started by this scope
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Record that an allocator handed out ids inside this scope
    pub(crate) fn mark_touched(&self, kind: EntityKind) {
        self.touched.borrow_mut().insert(kind);
    }

    // ========== Termination ==========

    /// Commit the scope. No-op when no mutating call ever started the
    /// backend transaction. On success the touched allocators keep
    /// their reservations: they are now durable.
    pub fn commit(self) -> Result<()> {
        self.finished.set(true);
        if !self.active.get() {
            return Ok(());
        }
        if !self.owns.get() {
            // Durability belongs to the enclosing scope; conservatively
            // drop the in-memory windows so they re-derive after it ends.
            self.reset_touched();
            return Ok(());
        }
        let committed = { self.store.db().commit() };
        if let Err(err) = committed {
            self.reset_touched();
            let db = self.store.db();
            if db.in_transaction() {
                if let Err(rollback_err) = db.rollback() {
                    tracing::warn!("rollback after failed commit failed: {}", rollback_err);
                }
            }
            return Err(err);
        }
        self.touched.borrow_mut().clear();
        Ok(())
    }

    /// Explicitly roll back the scope. Dropping without commit does the
    /// same.
    pub fn rollback(self) {
        self.finished.set(true);
        self.do_rollback();
    }

    fn reset_touched(&self) {
        for kind in self.touched.borrow_mut().drain() {
            self.store.reset_allocator(kind);
        }
    }

    fn do_rollback(&self) {
        self.reset_touched();
        if self.active.get() && self.owns.get() {
            if let Err(err) = self.store.db().rollback() {
                // Secondary failure; swallowed so it cannot mask the
                // error that brought us here.
                tracing::warn!("rollback failed: {}", err);
            }
        }
        self.active.set(false);
    }

    // ========== Mutating helpers ==========

    /// Execute a mutating statement, lazily starting the transaction
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.start()?;
        self.store.db().execute(sql, params)
    }

    /// Execute a DDL batch (schema providers)
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.start()?;
        self.store.db().execute_batch(sql)
    }

    /// Execute an INSERT, returning the new rowid
    pub fn insert<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<i64> {
        self.start()?;
        self.store.db().insert(sql, params)
    }

    /// Allocate the next id of a kind. Lazily starts the transaction
    /// when the allocator has to reserve a new batch; the reservation
    /// is durable only once this scope commits.
    pub fn allocate_id(&self, kind: EntityKind) -> Result<EntityId> {
        let allocator = self
            .store
            .allocator(kind)
            .ok_or(StorageError::NoSequence(kind))?;
        let value = allocator.allocate(self)?;
        Ok(EntityId::new(kind, value))
    }

    // ========== Read helpers ==========
    // Reads never force a backend transaction.

    pub fn query_row_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.store.db().query_row_opt(sql, params, f)
    }

    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.store.db().query_map(sql, params, f)
    }

    pub fn long_query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<i64>> {
        self.store.db().long_query(sql, params)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.store.db().has_table(name)
    }

    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        self.store.db().has_column(table, column)
    }

    // ========== Cascading-delete dispatch ==========
    // Forwarded to the optionally-registered cleaner; an empty slot
    // makes the call a no-op, so a delete-triggering module never
    // depends on the modules that cascade.

    pub fn delete_conversations(
        &self,
        subject: Option<EntityId>,
        twincode: Option<EntityId>,
    ) -> Result<()> {
        match self.store.cleaners().conversations() {
            Some(cleaner) => cleaner.delete_conversations(self, subject, twincode),
            None => Ok(()),
        }
    }

    pub fn delete_notifications(
        &self,
        subject: EntityId,
        twincode: Option<EntityId>,
        descriptor: Option<EntityId>,
    ) -> Result<()> {
        match self.store.cleaners().notifications() {
            Some(cleaner) => cleaner.delete_notifications(self, subject, twincode, descriptor),
            None => Ok(()),
        }
    }

    pub fn delete_image(&self, image: EntityId) -> Result<()> {
        match self.store.cleaners().images() {
            Some(cleaner) => cleaner.delete_image(self, image),
            None => Ok(()),
        }
    }

    pub fn delete_twincode(&self, twincode: &Arc<TwincodeOutbound>) -> Result<()> {
        match self.store.cleaners().twincodes() {
            Some(cleaner) => cleaner.delete_twincode(self, twincode),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            self.do_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn count(store: &ObjectStore, table: &str) -> i64 {
        store
            .long_query(&format!("SELECT COUNT(*) FROM {}", table), [])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_commit_makes_rows_visible() {
        let store = ObjectStore::open_in_memory().unwrap();
        let tx = store.begin();
        tx.execute(
            "INSERT INTO image (id, uuid, flags, modification_date) VALUES (?1, randomblob(16), 0, 0)",
            params![1],
        )
        .unwrap();
        tx.commit().unwrap();
        assert_eq!(count(&store, "image"), 1);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let store = ObjectStore::open_in_memory().unwrap();
        {
            let tx = store.begin();
            tx.execute(
                "INSERT INTO image (id, uuid, flags, modification_date) VALUES (?1, randomblob(16), 0, 0)",
                params![1],
            )
            .unwrap();
            // dropped here, still active
        }
        assert_eq!(count(&store, "image"), 0);
    }

    #[test]
    fn test_multi_insert_rollback_leaves_nothing() {
        let store = ObjectStore::open_in_memory().unwrap();
        let tx = store.begin();
        for i in 1..=4 {
            tx.execute(
                "INSERT INTO image (id, uuid, flags, modification_date) VALUES (?1, randomblob(16), 0, 0)",
                params![i],
            )
            .unwrap();
        }
        tx.rollback();
        assert_eq!(count(&store, "image"), 0);
    }

    #[test]
    fn test_commit_without_writes_is_a_noop() {
        let store = ObjectStore::open_in_memory().unwrap();
        let tx = store.begin();
        let _ = tx
            .long_query("SELECT COUNT(*) FROM image", [])
            .unwrap();
        assert!(!tx.is_active());
        tx.commit().unwrap();
    }

    #[test]
    fn test_dispatch_without_cleaner_is_a_noop() {
        let store = ObjectStore::open_in_memory_bare().unwrap();
        let tx = store.begin();
        tx.delete_conversations(None, None).unwrap();
        tx.delete_notifications(EntityId::new(EntityKind::Repository, 1), None, None)
            .unwrap();
        tx.delete_image(EntityId::new(EntityKind::Image, 1)).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_rollback_resets_touched_allocators() {
        let store = ObjectStore::open_in_memory().unwrap();
        let first = {
            let tx = store.begin();
            let id = tx.allocate_id(EntityKind::Conversation).unwrap();
            tx.rollback();
            id
        };
        // The reservation was rolled back with the transaction; the next
        // allocation reconciles from scratch and may reuse the value.
        let tx = store.begin();
        let second = tx.allocate_id(EntityKind::Conversation).unwrap();
        tx.commit().unwrap();
        assert_eq!(first.value, second.value);
    }
}
