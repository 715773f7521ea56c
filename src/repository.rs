//! Repository objects - schema-UUID-keyed domain entities
//!
//! Contacts, groups, and profiles all persist as repository objects.
//! The schema UUID tags the logical subtype; the schema version tracks
//! the subtype's own attribute layout, independent of the store schema.

use parking_lot::RwLock;
use rusqlite::params;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::entity::{
    decode_attributes, encode_attributes, AttributeMap, AttributeValue, EntityId, EntityKind,
    PersistedEntity, FLAG_DELETED,
};
use crate::factory::ObjectFactory;
use crate::migration::SchemaProvider;
use crate::transaction::Transaction;
use crate::Result;

const CREATE_REPOSITORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repository (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    schema_id BLOB NOT NULL,
    schema_version INTEGER NOT NULL,
    attributes TEXT NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    creation_date INTEGER NOT NULL,
    modification_date INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_repository_schema ON repository(schema_id);
"#;

#[derive(Debug)]
struct RepositoryState {
    attributes: AttributeMap,
    flags: u32,
    created: i64,
    modified: i64,
}

/// A persisted domain object (contact, group, profile).
#[derive(Debug)]
pub struct RepositoryObject {
    id: EntityId,
    uuid: Uuid,
    schema_id: Uuid,
    schema_version: i32,
    state: RwLock<RepositoryState>,
}

impl RepositoryObject {
    pub fn object_id(&self) -> Uuid {
        self.uuid
    }

    pub fn schema_version(&self) -> i32 {
        self.schema_version
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.read().attributes.get(name).cloned()
    }

    pub fn flags(&self) -> u32 {
        self.state.read().flags
    }

    pub fn created(&self) -> i64 {
        self.state.read().created
    }
}

impl PersistedEntity for RepositoryObject {
    fn id(&self) -> EntityId {
        self.id
    }

    fn uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }

    fn schema_id(&self) -> Option<Uuid> {
        Some(self.schema_id)
    }

    fn modified(&self) -> i64 {
        self.state.read().modified
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Typed row builder for new repository objects.
pub struct NewRepositoryObject {
    pub uuid: Uuid,
    pub schema_id: Uuid,
    pub schema_version: i32,
    pub attributes: AttributeMap,
    pub flags: u32,
    pub created: i64,
    pub modified: i64,
}

pub struct RepositoryFactory;

impl ObjectFactory for RepositoryFactory {
    type Object = RepositoryObject;
    type Values = NewRepositoryObject;

    fn kind(&self) -> EntityKind {
        EntityKind::Repository
    }

    fn columns(&self) -> &'static str {
        "uuid, schema_id, schema_version, attributes, flags, creation_date, modification_date"
    }

    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<RepositoryObject>>> {
        let uuid: Uuid = row.get(offset)?;
        let schema_id: Uuid = row.get(offset + 1)?;
        let schema_version: i32 = row.get(offset + 2)?;
        let raw: String = row.get(offset + 3)?;
        let flags = row.get::<_, i64>(offset + 4)? as u32;
        let created: i64 = row.get(offset + 5)?;
        let modified: i64 = row.get(offset + 6)?;

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
        Ok(Some(Arc::new(RepositoryObject {
            id,
            uuid,
            schema_id,
            schema_version,
            state: RwLock::new(RepositoryState {
                attributes,
                flags,
                created,
                modified,
            }),
        })))
    }

    fn load_object(
        &self,
        existing: &Arc<RepositoryObject>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool> {
        let modified: i64 = row.get(offset + 6)?;
        if modified == existing.modified() {
            return Ok(false);
        }
        let raw: String = row.get(offset + 3)?;
        let attributes = match decode_attributes(&raw) {
            Some(attributes) => attributes,
            None => {
                tracing::warn!("unreadable attributes for {}", existing.id());
                return Ok(false);
            }
        };
        let mut state = existing.state.write();
        state.attributes = attributes;
        state.flags = row.get::<_, i64>(offset + 4)? as u32;
        state.modified = modified;
        Ok(true)
    }

    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: NewRepositoryObject,
        initializer: Option<&dyn Fn(&RepositoryObject) -> Result<()>>,
    ) -> Result<Arc<RepositoryObject>> {
        let id = tx.allocate_id(EntityKind::Repository)?;
        let entity = Arc::new(RepositoryObject {
            id,
            uuid: values.uuid,
            schema_id: values.schema_id,
            schema_version: values.schema_version,
            state: RwLock::new(RepositoryState {
                attributes: values.attributes,
                flags: values.flags,
                created: values.created,
                modified: values.modified,
            }),
        });
        if let Some(initializer) = initializer {
            initializer(&entity)?;
        }

        let state = entity.state.read();
        let raw = encode_attributes(&state.attributes)?;
        tx.insert(
            "INSERT INTO repository \
             (id, uuid, schema_id, schema_version, attributes, flags, creation_date, modification_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.value,
                values.uuid,
                values.schema_id,
                values.schema_version,
                raw,
                state.flags as i64,
                state.created,
                state.modified,
            ],
        )?;
        drop(state);

        tx.store().cache().put(entity.clone());
        Ok(entity)
    }
}

pub struct RepositoryProvider;

impl SchemaProvider for RepositoryProvider {
    fn name(&self) -> &'static str {
        "repository"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Repository
    }

    fn on_create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_REPOSITORY_TABLE)
    }

    fn on_upgrade(&self, tx: &Transaction<'_>, _old_version: i32, _new_version: i32) -> Result<()> {
        tx.execute_batch(CREATE_REPOSITORY_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    fn contact_values(schema_id: Uuid, name: &str) -> NewRepositoryObject {
        let mut attributes = AttributeMap::new();
        attributes.insert(
            "name".to_string(),
            AttributeValue::String(name.to_string()),
        );
        NewRepositoryObject {
            uuid: Uuid::new_v4(),
            schema_id,
            schema_version: 1,
            attributes,
            flags: 0,
            created: 100,
            modified: 100,
        }
    }

    #[test]
    fn test_store_and_load_by_uuid() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = RepositoryFactory;
        let schema = Uuid::new_v4();

        let tx = store.begin();
        let object = factory
            .store_object(&tx, contact_values(schema, "Bob"), None)
            .unwrap();
        tx.commit().unwrap();

        let by_uuid = store
            .load_by_uuid(&factory, object.object_id())
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&by_uuid, &object));
        assert_eq!(by_uuid.schema_id(), Some(schema));
        assert_eq!(by_uuid.attribute("name").unwrap().as_str(), Some("Bob"));
    }

    #[test]
    fn test_evict_schema_drops_the_whole_subtype() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = RepositoryFactory;
        let contacts = Uuid::new_v4();
        let groups = Uuid::new_v4();

        let tx = store.begin();
        for name in ["a", "b"] {
            factory
                .store_object(&tx, contact_values(contacts, name), None)
                .unwrap();
        }
        let group = factory
            .store_object(&tx, contact_values(groups, "g"), None)
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.cache().len(), 3);
        store.cache().evict_schema(contacts);
        assert_eq!(store.cache().len(), 1);
        assert!(store.cache().get(group.id()).is_some());
    }

    #[test]
    fn test_missing_row_evicts_cached_instance() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = RepositoryFactory;
        let tx = store.begin();
        let object = factory
            .store_object(&tx, contact_values(Uuid::new_v4(), "gone"), None)
            .unwrap();
        tx.commit().unwrap();

        store
            .with_transaction(|tx| {
                tx.execute(
                    "DELETE FROM repository WHERE id = ?1",
                    params![object.id().value],
                )
            })
            .unwrap();

        assert!(store.load(&factory, object.id()).unwrap().is_none());
        assert!(store.cache().get(object.id()).is_none());
    }
}
