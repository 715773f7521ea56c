//! Object factories - the per-entity-kind materialization capability
//!
//! A uniform three-operation capability keeps the cache, query, and
//! transaction layers decoupled from the growing set of entity kinds:
//! a new kind plugs in by implementing `ObjectFactory` and registering
//! a schema provider for its tables.

use std::sync::Arc;

use crate::entity::{EntityId, EntityKind, PersistedEntity};
use crate::transaction::Transaction;
use crate::Result;

/// Materializes, refreshes, and inserts typed instances of one entity
/// kind.
///
/// `Values` is the typed row-builder for inserts: every column of the
/// kind's table except the allocated numeric id.
pub trait ObjectFactory: Send + Sync {
    type Object: PersistedEntity + 'static;
    type Values;

    /// The entity kind this factory materializes
    fn kind(&self) -> EntityKind;

    /// SELECT column list of the kind's table, excluding the id column.
    /// Loads place these columns at an arbitrary offset so composite
    /// joins can embed the entity anywhere in a row.
    fn columns(&self) -> &'static str;

    /// Column holding the secondary UUID key
    fn uuid_column(&self) -> &'static str {
        "uuid"
    }

    /// Build a fresh instance from a row whose entity columns start at
    /// `offset`. Returns `None` when the row encodes a logically-deleted
    /// or unreadable entity; the caller treats this as not found and
    /// may schedule cleanup.
    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<Self::Object>>>;

    /// Refresh an already-cached instance in place, only when the row's
    /// modification stamp differs from the cached one. Returns whether
    /// a refresh occurred.
    fn load_object(
        &self,
        existing: &Arc<Self::Object>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool>;

    /// Allocate an id, construct the instance, run the optional
    /// initializer (entity-specific post-construction wiring, e.g.
    /// cross-linking a paired entity) before the row is persisted,
    /// insert the row, and register the instance in the identity cache.
    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: Self::Values,
        initializer: Option<&dyn Fn(&Self::Object) -> Result<()>>,
    ) -> Result<Arc<Self::Object>>;
}
