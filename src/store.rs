//! Object store - the owning service
//!
//! Owns the backend handle, the identity cache, the per-kind
//! allocators, the schema registry, and the cleaner slots. Feature
//! modules receive an explicit store handle; there is no global
//! singleton.

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use rusqlite::params;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::allocator::SequenceAllocator;
use crate::cache::IdentityCache;
use crate::cleaner::CleanerRegistry;
use crate::config::{self, StoreConfig};
use crate::entity::{EntityId, EntityKind, PersistedEntity};
use crate::factory::ObjectFactory;
use crate::migration::{SchemaRegistry, SCHEMA_VERSION};
use crate::storage::Database;
use crate::transaction::Transaction;
use crate::{Result, StorageError};

/// The transactional object store.
///
/// One instance per database file, shared by reference between feature
/// modules. All mutation flows through [`Transaction`] scopes
/// serialized by the service lock; read-only queries bypass the lock
/// best-effort and are reconciled against the identity cache on the
/// next structured load.
pub struct ObjectStore {
    config: StoreConfig,
    db: Mutex<Database>,
    cache: IdentityCache,
    allocators: HashMap<EntityKind, SequenceAllocator>,
    registry: SchemaRegistry,
    cleaners: CleanerRegistry,
    service_lock: ReentrantMutex<()>,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore").finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Open (or create) the store with the given providers, running
    /// schema creation or migration as needed, then the open hooks.
    pub fn open(config: StoreConfig, registry: SchemaRegistry) -> Result<Self> {
        let db = match &config.database {
            Some(path) => {
                let path = Path::new(path);
                config::ensure_db_dir(path)?;
                Database::open(path)?
            }
            None => Database::open_in_memory()?,
        };

        let mut allocators = HashMap::new();
        for kind in EntityKind::all() {
            if kind.has_sequence() {
                allocators.insert(*kind, SequenceAllocator::new(*kind));
            }
        }

        let store = Self {
            config,
            db: Mutex::new(db),
            cache: IdentityCache::new(),
            allocators,
            registry,
            cleaners: CleanerRegistry::new(),
            service_lock: ReentrantMutex::new(()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open with the standard feature modules: twincodes, repository
    /// objects, conversations, notifications, and images, with their
    /// cleaners registered.
    pub fn open_with_defaults(config: StoreConfig) -> Result<Self> {
        let mut registry = SchemaRegistry::new();
        registry.register(Arc::new(crate::twincode::TwincodeProvider));
        registry.register(Arc::new(crate::repository::RepositoryProvider));
        registry.register(Arc::new(crate::conversation::ConversationProvider));
        registry.register(Arc::new(crate::notification::NotificationProvider));
        registry.register(Arc::new(crate::image::ImageProvider));

        let store = Self::open(config, registry)?;
        store
            .cleaners
            .set_conversations(Arc::new(crate::conversation::DefaultConversationsCleaner));
        store
            .cleaners
            .set_notifications(Arc::new(crate::notification::DefaultNotificationsCleaner));
        store
            .cleaners
            .set_images(Arc::new(crate::image::DefaultImagesCleaner));
        store
            .cleaners
            .set_twincodes(Arc::new(crate::twincode::DefaultTwincodesCleaner));
        Ok(store)
    }

    /// In-memory store with the standard feature modules (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_defaults(StoreConfig::default())
    }

    /// In-memory store with no providers and no cleaners (for testing)
    #[cfg(test)]
    pub(crate) fn open_in_memory_bare() -> Result<Self> {
        Self::open(StoreConfig::default(), SchemaRegistry::new())
    }

    fn initialize(&self) -> Result<()> {
        let version = self.db().schema_version()?;
        if version == 0 {
            self.registry.on_create(self)?;
        } else if version < SCHEMA_VERSION {
            tracing::info!("upgrading schema from version {} to {}", version, SCHEMA_VERSION);
            self.registry.on_upgrade(self, version, SCHEMA_VERSION)?;
        } else {
            self.check_version()?;
        }
        self.registry.on_open(self)
    }

    /// Reject databases written by a newer SDK
    pub(crate) fn check_version(&self) -> Result<()> {
        let version = self.db().schema_version()?;
        if version > SCHEMA_VERSION {
            return Err(StorageError::VersionTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn cleaners(&self) -> &CleanerRegistry {
        &self.cleaners
    }

    pub(crate) fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub(crate) fn service_lock(&self) -> &ReentrantMutex<()> {
        &self.service_lock
    }

    pub(crate) fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock()
    }

    pub(crate) fn allocator(&self, kind: EntityKind) -> Option<&SequenceAllocator> {
        self.allocators.get(&kind)
    }

    pub(crate) fn reset_allocator(&self, kind: EntityKind) {
        if let Some(allocator) = self.allocators.get(&kind) {
            allocator.reset();
        }
    }

    // ========== Transactions ==========

    /// Begin a transaction scope, taking the service lock
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Run a closure inside a transaction: commit on success, roll back
    /// on error.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin();
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ========== Raw read-only queries ==========
    // These bypass the service lock (best-effort).

    pub fn query_row_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.db().query_row_opt(sql, params, f)
    }

    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.db().query_map(sql, params, f)
    }

    pub fn long_query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<i64>> {
        self.db().long_query(sql, params)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.db().has_table(name)
    }

    // ========== Structured loads ==========

    /// Load an entity by id through its factory, reconciling the
    /// identity cache: a cached instance is refreshed in place when the
    /// row changed, evicted when the row is gone, and a fresh instance
    /// is registered otherwise.
    pub fn load<F: ObjectFactory>(&self, factory: &F, id: EntityId) -> Result<Option<Arc<F::Object>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            factory.columns(),
            factory.kind().table()
        );

        if let Some(cached) = self.cache.get_as::<F::Object>(id) {
            let outcome = self
                .db()
                .query_row_opt(&sql, params![id.value], |row| {
                    Ok(factory.load_object(&cached, row, 0))
                })?;
            return match outcome {
                None => {
                    self.cache.evict(id);
                    Ok(None)
                }
                Some(refresh) => {
                    if refresh? {
                        tracing::debug!("refreshed {} from storage", id);
                    }
                    Ok(Some(cached))
                }
            };
        }

        let created = self
            .db()
            .query_row_opt(&sql, params![id.value], |row| {
                Ok(factory.create_object(id, row, 0))
            })?;
        match created {
            None => Ok(None),
            Some(create) => match create? {
                None => Ok(None),
                Some(entity) => {
                    let canonical = self.cache.put(entity);
                    Ok(canonical.as_any_arc().downcast::<F::Object>().ok())
                }
            },
        }
    }

    /// Load an entity by its secondary UUID key. Resolves through the
    /// cache's secondary index first so the result is the same instance
    /// an id lookup returns.
    pub fn load_by_uuid<F: ObjectFactory>(
        &self,
        factory: &F,
        uuid: Uuid,
    ) -> Result<Option<Arc<F::Object>>> {
        if let Some(cached) = self.cache.get_by_uuid(uuid) {
            if let Ok(typed) = cached.as_any_arc().downcast::<F::Object>() {
                return self.load(factory, typed.id());
            }
        }

        let sql = format!(
            "SELECT id, {} FROM {} WHERE {} = ?1",
            factory.columns(),
            factory.kind().table(),
            factory.uuid_column()
        );
        let created = self
            .db()
            .query_row_opt(&sql, params![uuid], |row| {
                let value: i64 = row.get(0)?;
                let id = EntityId::new(factory.kind(), value);
                Ok(factory.create_object(id, row, 1))
            })?;
        match created {
            None => Ok(None),
            Some(create) => match create? {
                None => Ok(None),
                Some(entity) => {
                    let canonical = self.cache.put(entity);
                    Ok(canonical.as_any_arc().downcast::<F::Object>().ok())
                }
            },
        }
    }
}
