//! Images - avatar and thumbnail records
//!
//! Full-size image data lives outside the store (media transport); the
//! store keeps the record and an optional thumbnail blob so the UI can
//! render without the media path.

use parking_lot::RwLock;
use rusqlite::params;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::cleaner::ImagesCleaner;
use crate::entity::{EntityId, EntityKind, PersistedEntity, FLAG_DELETED};
use crate::factory::ObjectFactory;
use crate::migration::{SchemaProvider, VERSION_IMAGES};
use crate::transaction::Transaction;
use crate::Result;

const CREATE_IMAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS image (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    flags INTEGER NOT NULL DEFAULT 0,
    modification_date INTEGER NOT NULL,
    thumbnail BLOB
);
"#;

#[derive(Debug)]
struct ImageState {
    flags: u32,
    modified: i64,
    thumbnail: Option<Vec<u8>>,
}

/// A stored image record.
#[derive(Debug)]
pub struct ImageRecord {
    id: EntityId,
    uuid: Uuid,
    state: RwLock<ImageState>,
}

impl ImageRecord {
    pub fn image_id(&self) -> Uuid {
        self.uuid
    }

    pub fn flags(&self) -> u32 {
        self.state.read().flags
    }

    pub fn thumbnail(&self) -> Option<Vec<u8>> {
        self.state.read().thumbnail.clone()
    }
}

impl PersistedEntity for ImageRecord {
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

/// Typed row builder for new image records.
pub struct NewImage {
    pub uuid: Uuid,
    pub flags: u32,
    pub modified: i64,
    pub thumbnail: Option<Vec<u8>>,
}

pub struct ImageFactory;

impl ObjectFactory for ImageFactory {
    type Object = ImageRecord;
    type Values = NewImage;

    fn kind(&self) -> EntityKind {
        EntityKind::Image
    }

    fn columns(&self) -> &'static str {
        "uuid, flags, modification_date, thumbnail"
    }

    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<ImageRecord>>> {
        let uuid: Uuid = row.get(offset)?;
        let flags = row.get::<_, i64>(offset + 1)? as u32;
        let modified: i64 = row.get(offset + 2)?;
        let thumbnail: Option<Vec<u8>> = row.get(offset + 3)?;

        if flags & FLAG_DELETED != 0 {
            return Ok(None);
        }
        Ok(Some(Arc::new(ImageRecord {
            id,
            uuid,
            state: RwLock::new(ImageState {
                flags,
                modified,
                thumbnail,
            }),
        })))
    }

    fn load_object(
        &self,
        existing: &Arc<ImageRecord>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool> {
        let modified: i64 = row.get(offset + 2)?;
        if modified == existing.modified() {
            return Ok(false);
        }
        let mut state = existing.state.write();
        state.flags = row.get::<_, i64>(offset + 1)? as u32;
        state.modified = modified;
        state.thumbnail = row.get(offset + 3)?;
        Ok(true)
    }

    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: NewImage,
        initializer: Option<&dyn Fn(&ImageRecord) -> Result<()>>,
    ) -> Result<Arc<ImageRecord>> {
        let id = tx.allocate_id(EntityKind::Image)?;
        let entity = Arc::new(ImageRecord {
            id,
            uuid: values.uuid,
            state: RwLock::new(ImageState {
                flags: values.flags,
                modified: values.modified,
                thumbnail: values.thumbnail,
            }),
        });
        if let Some(initializer) = initializer {
            initializer(&entity)?;
        }

        let state = entity.state.read();
        tx.insert(
            "INSERT INTO image (id, uuid, flags, modification_date, thumbnail) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.value,
                values.uuid,
                state.flags as i64,
                state.modified,
                state.thumbnail,
            ],
        )?;
        drop(state);

        tx.store().cache().put(entity.clone());
        Ok(entity)
    }
}

pub struct ImageProvider;

impl SchemaProvider for ImageProvider {
    fn name(&self) -> &'static str {
        "images"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Image
    }

    fn on_create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_IMAGE_TABLE)
    }

    fn on_upgrade(&self, tx: &Transaction<'_>, old_version: i32, _new_version: i32) -> Result<()> {
        if old_version < VERSION_IMAGES {
            tx.execute_batch(CREATE_IMAGE_TABLE)?;
        }
        Ok(())
    }
}

/// Deletes the image row and drops the cached record.
pub struct DefaultImagesCleaner;

impl ImagesCleaner for DefaultImagesCleaner {
    fn delete_image(&self, tx: &Transaction<'_>, image: EntityId) -> Result<()> {
        tx.execute("DELETE FROM image WHERE id = ?1", params![image.value])?;
        tx.store().cache().evict(image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    #[test]
    fn test_image_roundtrip_with_thumbnail() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = ImageFactory;
        let tx = store.begin();
        let image = factory
            .store_object(
                &tx,
                NewImage {
                    uuid: Uuid::new_v4(),
                    flags: 0,
                    modified: 5,
                    thumbnail: Some(vec![1, 2, 3]),
                },
                None,
            )
            .unwrap();
        tx.commit().unwrap();

        store.cache().clear();
        let loaded = store.load(&factory, image.id()).unwrap().unwrap();
        assert_eq!(loaded.image_id(), image.image_id());
        assert_eq!(loaded.thumbnail(), Some(vec![1, 2, 3]));
        // a fresh instance, since the cache was dropped
        assert!(!Arc::ptr_eq(&loaded, &image));
    }

    #[test]
    fn test_delete_image_evicts_cache_entry() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = ImageFactory;
        let tx = store.begin();
        let image = factory
            .store_object(
                &tx,
                NewImage {
                    uuid: Uuid::new_v4(),
                    flags: 0,
                    modified: 0,
                    thumbnail: None,
                },
                None,
            )
            .unwrap();
        tx.commit().unwrap();

        store
            .with_transaction(|tx| tx.delete_image(image.id()))
            .unwrap();
        assert!(store.cache().get(image.id()).is_none());
        assert_eq!(
            store.long_query("SELECT COUNT(*) FROM image", []).unwrap(),
            Some(0)
        );
    }
}
