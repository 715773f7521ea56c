//! Identity cache - process-wide entity map
//!
//! Keeps at most one live instance per `EntityId`, with a secondary
//! index by UUID. The cache carries no transactional semantics: loads
//! reconcile cached instances against fresh row data through the
//! object factories.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::entity::{EntityId, PersistedEntity};

/// Concurrency-safe two-index map over live entity instances.
#[derive(Default)]
pub struct IdentityCache {
    by_id: RwLock<HashMap<EntityId, Arc<dyn PersistedEntity>>>,
    by_uuid: RwLock<HashMap<Uuid, EntityId>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live instance for an id
    pub fn get(&self, id: EntityId) -> Option<Arc<dyn PersistedEntity>> {
        self.by_id.read().get(&id).cloned()
    }

    /// Get the live instance registered under a UUID. Resolves through
    /// the secondary map so the result is the same instance an id
    /// lookup returns.
    pub fn get_by_uuid(&self, uuid: Uuid) -> Option<Arc<dyn PersistedEntity>> {
        let id = *self.by_uuid.read().get(&uuid)?;
        self.get(id)
    }

    /// Typed lookup
    pub fn get_as<T: PersistedEntity + 'static>(&self, id: EntityId) -> Option<Arc<T>> {
        self.get(id).and_then(|e| e.as_any_arc().downcast::<T>().ok())
    }

    /// Register an instance under both indexes.
    ///
    /// First registration wins: when an instance is already live for
    /// the id, the existing one is returned and the argument dropped,
    /// so concurrent loaders converge on a single instance.
    pub fn put(&self, entity: Arc<dyn PersistedEntity>) -> Arc<dyn PersistedEntity> {
        let id = entity.id();
        let mut by_id = self.by_id.write();
        if let Some(existing) = by_id.get(&id) {
            return existing.clone();
        }
        if let Some(uuid) = entity.uuid() {
            self.by_uuid.write().insert(uuid, id);
        }
        by_id.insert(id, entity.clone());
        entity
    }

    /// Remove an instance from both indexes
    pub fn evict(&self, id: EntityId) {
        let removed = self.by_id.write().remove(&id);
        if let Some(entity) = removed {
            if let Some(uuid) = entity.uuid() {
                self.by_uuid.write().remove(&uuid);
            }
        }
    }

    /// Bulk removal of a whole logical subtype (repository objects
    /// sharing one schema UUID)
    pub fn evict_schema(&self, schema_id: Uuid) {
        let ids: Vec<EntityId> = self
            .by_id
            .read()
            .values()
            .filter(|e| e.schema_id() == Some(schema_id))
            .map(|e| e.id())
            .collect();
        for id in ids {
            self.evict(id);
        }
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.read().is_empty()
    }

    /// Drop every cached instance (service shutdown)
    pub fn clear(&self) {
        self.by_id.write().clear();
        self.by_uuid.write().clear();
    }
}
