//! Schema registry - versioned, resumable migration
//!
//! Every feature module supplies a provider with create/upgrade/open
//! hooks. Creation runs under a single commit; upgrades commit one
//! provider at a time so an interrupted upgrade resumes at the next
//! provider after restart - which is why every provider's upgrade steps
//! are guarded by existence checks.

use std::sync::Arc;

use crate::entity::EntityKind;
use crate::storage::schema;
use crate::store::ObjectStore;
use crate::transaction::Transaction;
use crate::Result;

/// Current on-disk layout version (SQLite `user_version`)
pub const SCHEMA_VERSION: i32 = 21;

/// The shared sequence table replaced per-feature counters
pub const VERSION_SEQUENCE_TABLE: i32 = 14;
/// Notifications gained a descriptor reference
pub const VERSION_NOTIFICATION_DESCRIPTOR: i32 = 17;
/// Twincode key material moved to its own table
pub const VERSION_TWINCODE_KEYS: i32 = 19;
/// Image records moved into the store
pub const VERSION_IMAGES: i32 = 20;
/// Conversation invitations became persistent
pub const VERSION_INVITATIONS: i32 = 21;

/// Migration hooks supplied by a feature module.
pub trait SchemaProvider: Send + Sync {
    /// Stable name, used for logging only
    fn name(&self) -> &'static str;

    /// The module's primary entity kind
    fn kind(&self) -> EntityKind;

    /// Create the module's tables on a fresh database
    fn on_create(&self, tx: &Transaction<'_>) -> Result<()>;

    /// Bring the module's tables from `old_version` to `new_version`.
    /// Must be idempotent: an interrupted upgrade re-runs this with the
    /// same `old_version` after restart.
    fn on_upgrade(&self, tx: &Transaction<'_>, old_version: i32, new_version: i32) -> Result<()>;

    /// Called after the schema is current, outside any transaction.
    /// Failures are logged, not fatal.
    fn on_open(&self, _store: &ObjectStore) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of feature providers driving schema migration.
#[derive(Default)]
pub struct SchemaRegistry {
    providers: Vec<Arc<dyn SchemaProvider>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Creation and upgrade run in registration
    /// order.
    pub fn register(&mut self, provider: Arc<dyn SchemaProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn SchemaProvider>] {
        &self.providers
    }

    /// Create a fresh schema: the shared sequence table, then every
    /// provider's tables, then the version stamp - one commit for the
    /// whole thing.
    pub(crate) fn on_create(&self, store: &ObjectStore) -> Result<()> {
        tracing::info!("creating schema version {}", SCHEMA_VERSION);
        let tx = store.begin();
        tx.execute_batch(schema::CREATE_SEQUENCE_TABLE)?;
        for provider in &self.providers {
            provider.on_create(&tx)?;
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        tx.commit()
    }

    /// Upgrade from `old_version`. The legacy-counter merge commits on
    /// its own, then each provider runs in a separate committed
    /// transaction; the version stamp is written only once every
    /// provider succeeded, so an interrupted upgrade re-enters at
    /// `old_version` and relies on the providers' idempotent guards.
    pub(crate) fn on_upgrade(&self, store: &ObjectStore, old_version: i32, new_version: i32) -> Result<()> {
        let tx = store.begin();
        if tx.has_table(schema::LEGACY_COUNTERS_TABLE)? {
            tracing::info!("merging legacy counters into the sequence table");
            tx.execute_batch(schema::CREATE_SEQUENCE_TABLE)?;
            tx.execute(schema::MERGE_LEGACY_COUNTERS, [])?;
            tx.execute_batch(schema::DROP_LEGACY_COUNTERS)?;
        } else if old_version < VERSION_SEQUENCE_TABLE {
            tx.execute_batch(schema::CREATE_SEQUENCE_TABLE)?;
        }
        tx.commit()?;

        for provider in &self.providers {
            tracing::info!(
                "upgrading {} from version {} to {}",
                provider.name(),
                old_version,
                new_version
            );
            let tx = store.begin();
            provider.on_upgrade(&tx, old_version, new_version)?;
            tx.commit()?;
        }

        let tx = store.begin();
        tx.execute_batch(&format!("PRAGMA user_version = {}", new_version))?;
        tx.commit()
    }

    /// Apply connection pragmas, then every provider's open hook,
    /// best-effort.
    pub(crate) fn on_open(&self, store: &ObjectStore) -> Result<()> {
        store.db().configure(store.config())?;
        for provider in &self.providers {
            if let Err(err) = provider.on_open(store) {
                tracing::warn!("open hook of {} failed: {}", provider.name(), err);
            }
        }
        Ok(())
    }
}
