//! Notifications - pending user-visible events
//!
//! A notification always points at a subject (the repository object it
//! concerns) and may narrow to the peer twincode and the conversation
//! descriptor that raised it. Rows are immutable once written; they are
//! deleted when dismissed or when their subject goes away.

use rusqlite::params;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::cleaner::NotificationsCleaner;
use crate::entity::{EntityId, EntityKind, PersistedEntity};
use crate::factory::ObjectFactory;
use crate::migration::{SchemaProvider, VERSION_NOTIFICATION_DESCRIPTOR};
use crate::transaction::Transaction;
use crate::Result;

const CREATE_NOTIFICATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notification (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    kind INTEGER NOT NULL,
    subject_id INTEGER NOT NULL,
    twincode_id INTEGER,
    descriptor_id INTEGER,
    flags INTEGER NOT NULL DEFAULT 0,
    creation_date INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notification_subject ON notification(subject_id);
"#;

/// A stored notification. Immutable after insert.
#[derive(Debug)]
pub struct NotificationRecord {
    id: EntityId,
    uuid: Uuid,
    kind: i32,
    subject_id: EntityId,
    twincode_id: Option<EntityId>,
    descriptor_id: Option<EntityId>,
    flags: u32,
    created: i64,
}

impl NotificationRecord {
    pub fn notification_id(&self) -> Uuid {
        self.uuid
    }

    pub fn notification_kind(&self) -> i32 {
        self.kind
    }

    pub fn subject_id(&self) -> EntityId {
        self.subject_id
    }

    pub fn twincode_id(&self) -> Option<EntityId> {
        self.twincode_id
    }

    pub fn descriptor_id(&self) -> Option<EntityId> {
        self.descriptor_id
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

impl PersistedEntity for NotificationRecord {
    fn id(&self) -> EntityId {
        self.id
    }

    fn uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }

    fn modified(&self) -> i64 {
        self.created
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Typed row builder for new notifications.
pub struct NewNotification {
    pub uuid: Uuid,
    pub kind: i32,
    pub subject_id: EntityId,
    pub twincode_id: Option<EntityId>,
    pub descriptor_id: Option<EntityId>,
    pub flags: u32,
    pub created: i64,
}

pub struct NotificationFactory;

impl ObjectFactory for NotificationFactory {
    type Object = NotificationRecord;
    type Values = NewNotification;

    fn kind(&self) -> EntityKind {
        EntityKind::Notification
    }

    fn columns(&self) -> &'static str {
        "uuid, kind, subject_id, twincode_id, descriptor_id, flags, creation_date"
    }

    fn create_object(
        &self,
        id: EntityId,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<Option<Arc<NotificationRecord>>> {
        let record = NotificationRecord {
            id,
            uuid: row.get(offset)?,
            kind: row.get(offset + 1)?,
            subject_id: EntityId::new(EntityKind::Repository, row.get(offset + 2)?),
            twincode_id: row
                .get::<_, Option<i64>>(offset + 3)?
                .map(|v| EntityId::new(EntityKind::TwincodeInbound, v)),
            descriptor_id: row
                .get::<_, Option<i64>>(offset + 4)?
                .map(|v| EntityId::new(EntityKind::Descriptor, v)),
            flags: row.get::<_, i64>(offset + 5)? as u32,
            created: row.get(offset + 6)?,
        };
        Ok(Some(Arc::new(record)))
    }

    fn load_object(
        &self,
        existing: &Arc<NotificationRecord>,
        row: &rusqlite::Row<'_>,
        offset: usize,
    ) -> Result<bool> {
        // Rows are immutable; a differing stamp means the id was reused,
        // which the allocator rules out for committed rows.
        let created: i64 = row.get(offset + 6)?;
        if created != existing.created {
            tracing::warn!("notification {} changed on disk", existing.id());
        }
        Ok(false)
    }

    fn store_object(
        &self,
        tx: &Transaction<'_>,
        values: NewNotification,
        initializer: Option<&dyn Fn(&NotificationRecord) -> Result<()>>,
    ) -> Result<Arc<NotificationRecord>> {
        let id = tx.allocate_id(EntityKind::Notification)?;
        let entity = Arc::new(NotificationRecord {
            id,
            uuid: values.uuid,
            kind: values.kind,
            subject_id: values.subject_id,
            twincode_id: values.twincode_id,
            descriptor_id: values.descriptor_id,
            flags: values.flags,
            created: values.created,
        });
        if let Some(initializer) = initializer {
            initializer(&entity)?;
        }

        tx.insert(
            "INSERT INTO notification \
             (id, uuid, kind, subject_id, twincode_id, descriptor_id, flags, creation_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.value,
                values.uuid,
                values.kind,
                values.subject_id.value,
                values.twincode_id.map(|t| t.value),
                values.descriptor_id.map(|d| d.value),
                values.flags as i64,
                values.created,
            ],
        )?;

        tx.store().cache().put(entity.clone());
        Ok(entity)
    }
}

pub struct NotificationProvider;

impl SchemaProvider for NotificationProvider {
    fn name(&self) -> &'static str {
        "notifications"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Notification
    }

    fn on_create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_NOTIFICATION_TABLE)
    }

    fn on_upgrade(&self, tx: &Transaction<'_>, old_version: i32, _new_version: i32) -> Result<()> {
        if !tx.has_table("notification")? {
            return tx.execute_batch(CREATE_NOTIFICATION_TABLE);
        }
        if old_version < VERSION_NOTIFICATION_DESCRIPTOR
            && !tx.has_column("notification", "descriptor_id")?
        {
            tx.execute("ALTER TABLE notification ADD COLUMN descriptor_id INTEGER", [])?;
        }
        Ok(())
    }
}

/// Deletes the notifications of a subject, optionally narrowed to one
/// peer twincode and/or one descriptor, evicting the cached records.
pub struct DefaultNotificationsCleaner;

impl NotificationsCleaner for DefaultNotificationsCleaner {
    fn delete_notifications(
        &self,
        tx: &Transaction<'_>,
        subject: EntityId,
        twincode: Option<EntityId>,
        descriptor: Option<EntityId>,
    ) -> Result<()> {
        let mut predicate = String::from("subject_id = ?1");
        let mut values: Vec<i64> = vec![subject.value];
        if let Some(twincode) = twincode {
            values.push(twincode.value);
            predicate.push_str(&format!(" AND twincode_id = ?{}", values.len()));
        }
        if let Some(descriptor) = descriptor {
            values.push(descriptor.value);
            predicate.push_str(&format!(" AND descriptor_id = ?{}", values.len()));
        }

        let ids = tx.query_map(
            &format!("SELECT id FROM notification WHERE {}", predicate),
            rusqlite::params_from_iter(values.iter()),
            |row| row.get::<_, i64>(0),
        )?;
        tx.execute(
            &format!("DELETE FROM notification WHERE {}", predicate),
            rusqlite::params_from_iter(values.iter()),
        )?;
        for value in ids {
            tx.store()
                .cache()
                .evict(EntityId::new(EntityKind::Notification, value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    fn subject() -> EntityId {
        EntityId::new(EntityKind::Repository, 1)
    }

    fn values(kind: i32, twincode: Option<i64>, descriptor: Option<i64>) -> NewNotification {
        NewNotification {
            uuid: Uuid::new_v4(),
            kind,
            subject_id: subject(),
            twincode_id: twincode.map(|v| EntityId::new(EntityKind::TwincodeInbound, v)),
            descriptor_id: descriptor.map(|v| EntityId::new(EntityKind::Descriptor, v)),
            flags: 0,
            created: 10,
        }
    }

    #[test]
    fn test_store_and_reload() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = NotificationFactory;
        let tx = store.begin();
        let record = factory.store_object(&tx, values(3, Some(7), None), None).unwrap();
        tx.commit().unwrap();

        let loaded = store.load(&factory, record.id()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &record));
        assert_eq!(loaded.notification_kind(), 3);
        assert_eq!(loaded.twincode_id().map(|t| t.value), Some(7));
    }

    #[test]
    fn test_cleaner_narrows_by_twincode_and_descriptor() {
        let store = ObjectStore::open_in_memory().unwrap();
        let factory = NotificationFactory;
        let tx = store.begin();
        factory.store_object(&tx, values(1, Some(7), Some(100)), None).unwrap();
        factory.store_object(&tx, values(1, Some(7), Some(200)), None).unwrap();
        factory.store_object(&tx, values(1, Some(8), None), None).unwrap();
        tx.commit().unwrap();

        // only the subject+twincode 7+descriptor 100 row goes away
        store
            .with_transaction(|tx| {
                tx.delete_notifications(
                    subject(),
                    Some(EntityId::new(EntityKind::TwincodeInbound, 7)),
                    Some(EntityId::new(EntityKind::Descriptor, 100)),
                )
            })
            .unwrap();
        assert_eq!(
            store.long_query("SELECT COUNT(*) FROM notification", []).unwrap(),
            Some(2)
        );

        // the whole subject
        store
            .with_transaction(|tx| tx.delete_notifications(subject(), None, None))
            .unwrap();
        assert_eq!(
            store.long_query("SELECT COUNT(*) FROM notification", []).unwrap(),
            Some(0)
        );
        // cache followed the deletes
        assert_eq!(store.cache().len(), 0);
    }
}
