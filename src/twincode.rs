//! Twincodes - pseudonymous identities exchanged between peers
//!
//! An outbound twincode is the local projection of an identity; an
//! inbound twincode is the paired counterpart received from a peer.
//! Key material and negotiated secrets live in side tables keyed by the
//! twincode's numeric id, which is why deleting a twincode cascades.

use parking_lot::RwLock;
use rusqlite::params;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::cleaner::TwincodesCleaner;
use crate::entity::{
    decode_attributes, encode_attributes, AttributeMap, AttributeValue, EntityId, EntityKind,
    PersistedEntity, FLAG_DELETED,
};
use crate::factory::ObjectFactory;
use crate::migration::{SchemaProvider, VERSION_TWINCODE_KEYS};
use crate::transaction::Transaction;
use crate::Result;

const CREATE_TWINCODE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS twincode_inbound (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    attributes TEXT NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    modification_date INTEGER NOT NULL,
    pair_id INTEGER
);

CREATE TABLE IF NOT EXISTS twincode_outbound (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    attributes TEXT NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    modification_date INTEGER NOT NULL,
    pair_id INTEGER,
    avatar_id INTEGER
);
"#;

const CREATE_KEY_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS twincode_keys (
    id INTEGER PRIMARY KEY,
    pair_id INTEGER,
    public_key BLOB,
    private_key BLOB,
    flags INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS secret_keys (
    twincode_id INTEGER NOT NULL,
    peer_id INTEGER NOT NULL,
    secret BLOB NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (twincode_id, peer_id)
);

CREATE INDEX IF NOT EXISTS idx_secret_keys_peer ON secret_keys(peer_id);
"#;

// ========== Entities ==========

#[derive(Debug)]
struct TwincodeState {
    attributes: AttributeMap,
    flags: u32,
    modified: i64,
    pair_id: Option<EntityId>,
    avatar_id: Option<EntityId>,
}

/// Local projection of an identity exchanged with peers.
#[derive(Debug)]
pub struct TwincodeOutbound {
    id: EntityId,
    uuid: Uuid,
    state: RwLock<TwincodeState>,
}

impl TwincodeOutbound {
    fn new(
        id: EntityId,
        uuid: Uuid,
        attributes: AttributeMap,
        flags: u32,
        modified: i64,
        pair_id: Option<EntityId>,
        avatar_id: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            uuid,
            state: RwLock::new(TwincodeState {
                attributes,
                flags,
                modified,
                pair_id,
                avatar_id,
            }),
        }
    }

    /// The exchanged twincode UUID
    pub fn twincode_id(&self) -> Uuid {
        self.uuid
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.read().attributes.get(name).cloned()
    }

    /// Display name, when the attribute set carries one
    pub fn name(&self) -> Option<String> {
        self.attribute("name")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn flags(&self) -> u32 {
        self.state.read().flags
    }

    pub fn pair_id(&self) -> Option<EntityId> {
        self.state.read().pair_id
    }

    pub fn avatar_id(&self) -> Option<EntityId> {
        self.state.read().avatar_id
    }

    /// Cross-link the paired inbound twincode (store initializer)
    pub fn set_pair(&self, pair: EntityId) {
        self.state.write().pair_id = Some(pair);
    }

    /// Attach an avatar image (store initializer)
    pub fn set_avatar(&self, image: EntityId) {
        self.state.write().avatar_id = Some(image);
    }

    fn refresh(
        &self,
        attributes: AttributeMap,
        flags: u32,
        modified: i64,
        pair_id: Option<EntityId>,
        avatar_id: Option<EntityId>,
    ) {
        let mut state = self.state.write();
        state.attributes = attributes;
        state.flags = flags;
        state.modified = modified;
        state.pair_id = pair_id;
        state.avatar_id = avatar_id;
    }
}

impl PersistedEntity for TwincodeOutbound {
    fn id(&self) -> EntityId {
        self.id
    }

    fn uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }

    fn modified(&self) -> i64 {
        self.state.read().modified
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Paired counterpart received from a peer.
#[derive(Debug)]
pub struct TwincodeInbound {
    id: EntityId,
    uuid: Uuid,
    state: RwLock<TwincodeState>,
}

impl TwincodeInbound {
    fn new(
        id: EntityId,
        uuid: Uuid,
        attributes: AttributeMap,
        flags: u32,
        modified: i64,
        pair_id: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            uuid,
            state: RwLock::new(TwincodeState {
                attributes,
                flags,
                modified,
                pair_id,
                avatar_id: None,
            }),
        }
    }

    pub fn twincode_id(&self) -> Uuid {
        self.uuid
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.read().attributes.get(name).cloned()
    }

    pub fn flags(&self) -> u32 {
        self.state.read().flags
    }

    pub fn pair_id(&self) -> Option<EntityId> {
        self.state.read().pair_id
    }

    pub fn set_pair(&self, pair: EntityId) {
        self.state.write().pair_id = Some(pair);
    }
}

impl PersistedEntity for TwincodeInbound {
    fn id(&self) -> EntityId {
        self.id
    }

    fn uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }

    fn modified(&self) -> i64 {
        self.state.read().modified
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ========== Factories ==========

/// Typed row builder for new twincodes (both directions).
pub struct NewTwincode {
    pub uuid: Uuid,
    pub attributes: AttributeMap,
    pub flags: u32,
    pub modified: i64,
    pub pair_id: Option<EntityId>,
    pub avatar_id: Option<EntityId>,
}

pub struct TwincodeOutboundFactory;

impl ObjectFactory for TwincodeOutboundFactory {
    type Object = TwincodeOutbound;
    type Values = NewTwincode;

    fn kind(&self) -> EntityKind {
        EntityKind::TwincodeOutbound
    }

    fn columns(&self) -> &'static str {
        "uuid, attributes, flags, modification_date, pair_id, avatar_id"
    }

    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<TwincodeOutbound>>> {
        let uuid: Uuid = row.get(offset)?;
        let raw: String = row.get(offset + 1)?;
        let flags = row.get::<_, i64>(offset + 2)? as u32;
        let modified: i64 = row.get(offset + 3)?;
        let pair = row.get::<_, Option<i64>>(offset + 4)?;
        let avatar = row.get::<_, Option<i64>>(offset + 5)?;

        if flags & FLAG_DELETED != 0 {
            return Ok(None);
        }
        let attributes = match decode_attributes(&raw) {
            Some(attributes) => attributes,
            None => {
                tracing::warn!("unreadable attributes for {}", id);
                return Ok(None);
            }
        };
        Ok(Some(Arc::new(TwincodeOutbound::new(
            id,
            uuid,
            attributes,
            flags,
            modified,
            pair.map(|v| EntityId::new(EntityKind::TwincodeInbound, v)),
            avatar.map(|v| EntityId::new(EntityKind::Image, v)),
        ))))
    }

    fn load_object(
        &self,
        existing: &Arc<TwincodeOutbound>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool> {
        let modified: i64 = row.get(offset + 3)?;
        if modified == existing.modified() {
            return Ok(false);
        }
        let raw: String = row.get(offset + 1)?;
        let attributes = match decode_attributes(&raw) {
            Some(attributes) => attributes,
            None => {
                tracing::warn!("unreadable attributes for {}", existing.id());
                return Ok(false);
            }
        };
        let flags = row.get::<_, i64>(offset + 2)? as u32;
        let pair = row.get::<_, Option<i64>>(offset + 4)?;
        let avatar = row.get::<_, Option<i64>>(offset + 5)?;
        existing.refresh(
            attributes,
            flags,
            modified,
            pair.map(|v| EntityId::new(EntityKind::TwincodeInbound, v)),
            avatar.map(|v| EntityId::new(EntityKind::Image, v)),
        );
        Ok(true)
    }

    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: NewTwincode,
        initializer: Option<&dyn Fn(&TwincodeOutbound) -> Result<()>>,
    ) -> Result<Arc<TwincodeOutbound>> {
        let id = tx.allocate_id(EntityKind::TwincodeOutbound)?;
        let entity = Arc::new(TwincodeOutbound::new(
            id,
            values.uuid,
            values.attributes,
            values.flags,
            values.modified,
            values.pair_id,
            values.avatar_id,
        ));
        if let Some(initializer) = initializer {
            initializer(&entity)?;
        }

        // Persist the post-initializer state so cross-links land in the row.
        let state = entity.state.read();
        let raw = encode_attributes(&state.attributes)?;
        tx.insert(
            "INSERT INTO twincode_outbound \
             (id, uuid, attributes, flags, modification_date, pair_id, avatar_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.value,
                values.uuid,
                raw,
                state.flags as i64,
                state.modified,
                state.pair_id.map(|p| p.value),
                state.avatar_id.map(|a| a.value),
            ],
        )?;
        drop(state);

        tx.store().cache().put(entity.clone());
        Ok(entity)
    }
}

pub struct TwincodeInboundFactory;

impl ObjectFactory for TwincodeInboundFactory {
    type Object = TwincodeInbound;
    type Values = NewTwincode;

    fn kind(&self) -> EntityKind {
        EntityKind::TwincodeInbound
    }

    fn columns(&self) -> &'static str {
        "uuid, attributes, flags, modification_date, pair_id"
    }

    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<TwincodeInbound>>> {
        let uuid: Uuid = row.get(offset)?;
        let raw: String = row.get(offset + 1)?;
        let flags = row.get::<_, i64>(offset + 2)? as u32;
        let modified: i64 = row.get(offset + 3)?;
        let pair = row.get::<_, Option<i64>>(offset + 4)?;

        if flags & FLAG_DELETED != 0 {
            return Ok(None);
        }
        let attributes = match decode_attributes(&raw) {
            Some(attributes) => attributes,
            None => {
                tracing::warn!("unreadable attributes for {}", id);
                return Ok(None);
            }
        };
        Ok(Some(Arc::new(TwincodeInbound::new(
            id,
            uuid,
            attributes,
            flags,
            modified,
            pair.map(|v| EntityId::new(EntityKind::TwincodeOutbound, v)),
        ))))
    }

    fn load_object(
        &self,
        existing: &Arc<TwincodeInbound>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool> {
        let modified: i64 = row.get(offset + 3)?;
        if modified == existing.modified() {
            return Ok(false);
        }
        let raw: String = row.get(offset + 1)?;
        let attributes = match decode_attributes(&raw) {
            Some(attributes) => attributes,
            None => {
                tracing::warn!("unreadable attributes for {}", existing.id());
                return Ok(false);
            }
        };
        let flags = row.get::<_, i64>(offset + 2)? as u32;
        let pair = row.get::<_, Option<i64>>(offset + 4)?;
        let mut state = existing.state.write();
        state.attributes = attributes;
        state.flags = flags;
        state.modified = modified;
        state.pair_id = pair.map(|v| EntityId::new(EntityKind::TwincodeOutbound, v));
        Ok(true)
    }

    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: NewTwincode,
        initializer: Option<&dyn Fn(&TwincodeInbound) -> Result<()>>,
    ) -> Result<Arc<TwincodeInbound>> {
        let id = tx.allocate_id(EntityKind::TwincodeInbound)?;
        let entity = Arc::new(TwincodeInbound::new(
            id,
            values.uuid,
            values.attributes,
            values.flags,
            values.modified,
            values.pair_id,
        ));
        if let Some(initializer) = initializer {
            initializer(&entity)?;
        }

        let state = entity.state.read();
        let raw = encode_attributes(&state.attributes)?;
        tx.insert(
            "INSERT INTO twincode_inbound \
             (id, uuid, attributes, flags, modification_date, pair_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.value,
                values.uuid,
                raw,
                state.flags as i64,
                state.modified,
                state.pair_id.map(|p| p.value),
            ],
        )?;
        drop(state);

        tx.store().cache().put(entity.clone());
        Ok(entity)
    }
}

// ========== Key material ==========

/// Insert or replace the key material row of a twincode
pub fn store_keys(
    tx: &Transaction<'_>,
    twincode: EntityId,
    pair: Option<EntityId>,
    public_key: Option<&[u8]>,
    private_key: Option<&[u8]>,
) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO twincode_keys (id, pair_id, public_key, private_key, flags) \
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![twincode.value, pair.map(|p| p.value), public_key, private_key],
    )?;
    Ok(())
}

/// Insert or replace a secret negotiated with a peer twincode
pub fn store_secret(
    tx: &Transaction<'_>,
    twincode: EntityId,
    peer: EntityId,
    secret: &[u8],
) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO secret_keys (twincode_id, peer_id, secret, flags) \
         VALUES (?1, ?2, ?3, 0)",
        params![twincode.value, peer.value, secret],
    )?;
    Ok(())
}

// ========== Schema provider ==========

pub struct TwincodeProvider;

impl SchemaProvider for TwincodeProvider {
    fn name(&self) -> &'static str {
        "twincodes"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::TwincodeOutbound
    }

    fn on_create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_TWINCODE_TABLES)?;
        tx.execute_batch(CREATE_KEY_TABLES)
    }

    fn on_upgrade(&self, tx: &Transaction<'_>, old_version: i32, _new_version: i32) -> Result<()> {
        if !tx.has_table("twincode_outbound")? {
            tx.execute_batch(CREATE_TWINCODE_TABLES)?;
        }
        if old_version < VERSION_TWINCODE_KEYS {
            tx.execute_batch(CREATE_KEY_TABLES)?;
        }
        Ok(())
    }
}

// ========== Cleaner ==========

/// Cascades a twincode delete: key material, secrets matching the id on
/// either side, the twincode's own row, and its avatar image. Runs
/// entirely inside the caller's uncommitted transaction.
pub struct DefaultTwincodesCleaner;

impl TwincodesCleaner for DefaultTwincodesCleaner {
    fn delete_twincode(
        &self,
        tx: &Transaction<'_>,
        twincode: &Arc<TwincodeOutbound>,
    ) -> Result<()> {
        let id = twincode.id();
        tx.execute(
            "DELETE FROM twincode_keys WHERE id = ?1",
            params![id.value],
        )?;
        tx.execute(
            "DELETE FROM secret_keys WHERE twincode_id = ?1 OR peer_id = ?1",
            params![id.value],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", id.kind.table()),
            params![id.value],
        )?;
        if let Some(avatar) = twincode.avatar_id() {
            tx.delete_image(avatar)?;
        }
        tx.store().cache().evict(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    fn sample_attributes(name: &str) -> AttributeMap {
        let mut attributes = AttributeMap::new();
        attributes.insert(
            "name".to_string(),
            AttributeValue::String(name.to_string()),
        );
        attributes
    }

    fn sample_values(name: &str) -> NewTwincode {
        NewTwincode {
            uuid: Uuid::new_v4(),
            attributes: sample_attributes(name),
            flags: 0,
            modified: 1000,
            pair_id: None,
            avatar_id: None,
        }
    }

    #[test]
    fn test_store_object_inserts_row_and_cache_entry() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = TwincodeOutboundFactory;

        let tx = store.begin();
        let twincode = factory.store_object(&tx, sample_values("Alice"), None).unwrap();
        tx.commit().unwrap();

        let rows = store
            .long_query("SELECT COUNT(*) FROM twincode_outbound", [])
            .unwrap();
        assert_eq!(rows, Some(1));
        assert_eq!(store.cache().len(), 1);

        // A later load returns the identical in-memory instance.
        let loaded = store.load(&factory, twincode.id()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &twincode));
        let by_uuid = store
            .load_by_uuid(&factory, twincode.twincode_id())
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&by_uuid, &twincode));
    }

    #[test]
    fn test_initializer_cross_links_the_pair() {
        let store = ObjectStore::open_in_memory().unwrap();
        let inbound_factory = TwincodeInboundFactory;
        let outbound_factory = TwincodeOutboundFactory;

        let tx = store.begin();
        let inbound = inbound_factory
            .store_object(&tx, sample_values("peer"), None)
            .unwrap();
        let pair = inbound.id();
        let outbound = outbound_factory
            .store_object(
                &tx,
                sample_values("Alice"),
                Some(&|t: &TwincodeOutbound| {
                    t.set_pair(pair);
                    Ok(())
                }),
            )
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(outbound.pair_id(), Some(pair));
        // The cross-link was written with the row, not after it.
        let stored = store
            .long_query(
                "SELECT pair_id FROM twincode_outbound WHERE id = ?1",
                params![outbound.id().value],
            )
            .unwrap();
        assert_eq!(stored, Some(pair.value));
    }

    #[test]
    fn test_load_refreshes_stale_instance_in_place() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = TwincodeOutboundFactory;
        let tx = store.begin();
        let twincode = factory.store_object(&tx, sample_values("old"), None).unwrap();
        tx.commit().unwrap();

        // Unchanged row: no refresh.
        store.load(&factory, twincode.id()).unwrap().unwrap();
        assert_eq!(twincode.name().as_deref(), Some("old"));

        // An identity-refresh module rewrote the row.
        let raw = encode_attributes(&sample_attributes("new")).unwrap();
        store
            .with_transaction(|tx| {
                tx.execute(
                    "UPDATE twincode_outbound SET attributes = ?1, modification_date = 2000 \
                     WHERE id = ?2",
                    params![raw, twincode.id().value],
                )
            })
            .unwrap();

        let loaded = store.load(&factory, twincode.id()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &twincode));
        assert_eq!(twincode.name().as_deref(), Some("new"));
        assert_eq!(twincode.modified(), 2000);
    }

    #[test]
    fn test_logically_deleted_twincode_is_not_found() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = TwincodeOutboundFactory;
        let tx = store.begin();
        let mut values = sample_values("ghost");
        values.flags = FLAG_DELETED;
        let twincode = factory.store_object(&tx, values, None).unwrap();
        let id = twincode.id();
        tx.commit().unwrap();

        // Not cached anymore once evicted, and create refuses the row.
        store.cache().evict(id);
        assert!(store.load(&factory, id).unwrap().is_none());
    }

    #[test]
    fn test_delete_twincode_cascades_inside_the_transaction() {
        let store = ObjectStore::open_in_memory().unwrap();
        let outbound_factory = TwincodeOutboundFactory;
        let image_factory = crate::image::ImageFactory;

        // Seed: a twincode with an avatar, key material, and secrets on
        // both sides.
        let tx = store.begin();
        let avatar = image_factory
            .store_object(
                &tx,
                crate::image::NewImage {
                    uuid: Uuid::new_v4(),
                    flags: 0,
                    modified: 0,
                    thumbnail: None,
                },
                None,
            )
            .unwrap();
        let avatar_id = avatar.id();
        let twincode = outbound_factory
            .store_object(
                &tx,
                sample_values("victim"),
                Some(&|t: &TwincodeOutbound| {
                    t.set_avatar(avatar_id);
                    Ok(())
                }),
            )
            .unwrap();
        let id = twincode.id();
        store_keys(&tx, id, None, Some(b"pub"), Some(b"priv")).unwrap();
        store_secret(&tx, id, EntityId::new(EntityKind::TwincodeInbound, 99), b"s1").unwrap();
        // a secret where this twincode is the peer side
        tx.execute(
            "INSERT INTO secret_keys (twincode_id, peer_id, secret, flags) VALUES (77, ?1, x'02', 0)",
            params![id.value],
        )
        .unwrap();
        tx.commit().unwrap();

        let tx = store.begin();
        tx.delete_twincode(&twincode).unwrap();

        // All four effects are present inside the uncommitted transaction.
        assert_eq!(
            tx.long_query("SELECT COUNT(*) FROM twincode_keys WHERE id = ?1", params![id.value])
                .unwrap(),
            Some(0)
        );
        assert_eq!(
            tx.long_query(
                "SELECT COUNT(*) FROM secret_keys WHERE twincode_id = ?1 OR peer_id = ?1",
                params![id.value]
            )
            .unwrap(),
            Some(0)
        );
        assert_eq!(
            tx.long_query(
                "SELECT COUNT(*) FROM twincode_outbound WHERE id = ?1",
                params![id.value]
            )
            .unwrap(),
            Some(0)
        );
        assert_eq!(
            tx.long_query("SELECT COUNT(*) FROM image WHERE id = ?1", params![avatar_id.value])
                .unwrap(),
            Some(0)
        );

        // None of them survive a rollback.
        tx.rollback();
        assert_eq!(
            store
                .long_query(
                    "SELECT COUNT(*) FROM twincode_outbound WHERE id = ?1",
                    params![id.value]
                )
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            store
                .long_query("SELECT COUNT(*) FROM image WHERE id = ?1", params![avatar_id.value])
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            store
                .long_query(
                    "SELECT COUNT(*) FROM secret_keys WHERE twincode_id = ?1 OR peer_id = ?1",
                    params![id.value]
                )
                .unwrap(),
            Some(2)
        );
    }
}
