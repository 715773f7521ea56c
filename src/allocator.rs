//! Sequence allocator - crash-safe batched id generation
//!
//! One allocator per entity kind hands out numeric ids from a reserved
//! batch. The batch ceiling is persisted in the shared sequence table,
//! so after a crash the next reservation starts past everything that
//! could have been handed out; at most BATCH-1 ids are burned. Ids are
//! unique per kind, not contiguous.

use parking_lot::Mutex;
use rusqlite::params;

use crate::entity::EntityKind;
use crate::transaction::Transaction;
use crate::Result;

/// Ids reserved per trip to the sequence table
pub const SEQUENCE_BATCH: i64 = 10;

/// In-memory reservation window. `{0,0}` is the unreconciled sentinel:
/// the next allocation must re-derive its position from the database.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct AllocatorState {
    next: i64,
    last: i64,
}

/// Batched id generator for one entity kind.
///
/// The state lock is kind-scoped and independent of the transaction
/// lock: allocation must work before a transaction is explicitly
/// started (it lazily starts one through the caller's handle).
pub struct SequenceAllocator {
    kind: EntityKind,
    state: Mutex<AllocatorState>,
}

impl SequenceAllocator {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Forget the in-memory reservation, forcing full reconciliation on
    /// next use. Called when a transaction that touched this allocator
    /// rolls back: the persisted ceiling may have been rolled back too.
    pub(crate) fn reset(&self) {
        *self.state.lock() = AllocatorState::default();
    }

    /// Allocate the next id for this kind.
    ///
    /// Runs inside the caller's transaction, lazily starting it when a
    /// reservation has to touch the database. The reservation becomes
    /// durable only once that transaction commits; the transaction
    /// records the touched kind so a rollback resets this allocator.
    pub fn allocate(&self, tx: &Transaction<'_>) -> Result<i64> {
        let name = self.kind.sequence_name();
        let mut state = self.state.lock();
        loop {
            if state.next < state.last {
                let id = state.next;
                state.next += 1;
                tx.mark_touched(self.kind);
                return Ok(id);
            }

            tx.start()?;
            let persisted =
                tx.long_query("SELECT id FROM sequence WHERE name = ?1", params![name])?;
            match persisted {
                None => {
                    let resume = self.resume_point(tx, 0)?;
                    tx.insert(
                        "INSERT INTO sequence (name, id) VALUES (?1, ?2)",
                        params![name, resume + SEQUENCE_BATCH],
                    )?;
                    state.next = resume + 1;
                    state.last = resume + SEQUENCE_BATCH;
                    tx.mark_touched(self.kind);
                    return Ok(resume);
                }
                Some(ceiling) => {
                    // Batch refill: the persisted ceiling is still the one
                    // we reserved, no need to rescan the live table.
                    let resume = if state.last != 0 && ceiling == state.last {
                        ceiling
                    } else {
                        self.resume_point(tx, ceiling)?
                    };
                    let reserved = resume + SEQUENCE_BATCH;
                    let updated = tx.execute(
                        "UPDATE sequence SET id = ?1 WHERE name = ?2 AND id = ?3",
                        params![reserved, name, ceiling],
                    )?;
                    if updated == 1 {
                        state.next = resume + 1;
                        state.last = reserved;
                        tx.mark_touched(self.kind);
                        return Ok(resume);
                    }
                    // Lost the conditional update: another reservation moved
                    // the ceiling. Drop the stale window and reconcile again.
                    tracing::debug!("sequence {} drifted, reconciling", name);
                    *state = AllocatorState::default();
                }
            }
        }
    }

    /// Resume point for a full reconciliation:
    /// `max(persisted ceiling, MAX(id) over the live table + 1)`.
    /// The MAX scan guards against historical drift between the counter
    /// and the table; an empty table resumes at 1.
    fn resume_point(&self, tx: &Transaction<'_>, persisted: i64) -> Result<i64> {
        let live = tx.long_query(
            &format!("SELECT MAX(id) FROM {}", self.kind.table()),
            [],
        )?;
        let next_free = live.map(|max| max + 1).unwrap_or(1);
        Ok(next_free.max(persisted))
    }
}
