//! Conversations - events, operations, annotations, invitations
//!
//! The messaging module owns these tables and queries them directly;
//! the store's part is their schema lifecycle and the cascading delete
//! other modules trigger when a contact or twincode goes away. A
//! descriptor is one conversation event carrying a per-conversation
//! sequence id assigned by the peer protocol, distinct from the
//! store-allocated numeric id.

use rusqlite::params_from_iter;

use crate::cleaner::ConversationsCleaner;
use crate::entity::{EntityId, EntityKind};
use crate::migration::{SchemaProvider, VERSION_INVITATIONS};
use crate::transaction::Transaction;
use crate::Result;

const CREATE_CONVERSATION_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversation (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    subject_id INTEGER NOT NULL,
    peer_twincode_id INTEGER,
    last_descriptor_id INTEGER,
    flags INTEGER NOT NULL DEFAULT 0,
    modification_date INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversation_subject ON conversation(subject_id);

CREATE TABLE IF NOT EXISTS descriptor (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL,
    sequence_id INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    creation_date INTEGER NOT NULL,
    modification_date INTEGER NOT NULL,
    payload BLOB
);

CREATE INDEX IF NOT EXISTS idx_descriptor_conversation ON descriptor(conversation_id);

CREATE TABLE IF NOT EXISTS operation (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL,
    descriptor_id INTEGER,
    kind INTEGER NOT NULL,
    creation_date INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS annotation (
    descriptor_id INTEGER NOT NULL,
    twincode_id INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    PRIMARY KEY (descriptor_id, twincode_id, kind)
);
"#;

const CREATE_INVITATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS invitation (
    id INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE,
    conversation_id INTEGER NOT NULL,
    twincode_id INTEGER,
    flags INTEGER NOT NULL DEFAULT 0,
    creation_date INTEGER NOT NULL
);
"#;

pub struct ConversationProvider;

impl SchemaProvider for ConversationProvider {
    fn name(&self) -> &'static str {
        "conversations"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Conversation
    }

    fn on_create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_CONVERSATION_TABLES)?;
        tx.execute_batch(CREATE_INVITATION_TABLE)
    }

    fn on_upgrade(&self, tx: &Transaction<'_>, old_version: i32, _new_version: i32) -> Result<()> {
        if !tx.has_table("conversation")? {
            tx.execute_batch(CREATE_CONVERSATION_TABLES)?;
        }
        if old_version < VERSION_INVITATIONS {
            tx.execute_batch(CREATE_INVITATION_TABLE)?;
        }
        Ok(())
    }
}

/// Deletes the conversations selected by subject and/or peer twincode,
/// together with their descriptors, annotations, operations, and
/// invitations - all inside the caller's uncommitted transaction.
pub struct DefaultConversationsCleaner;

impl ConversationsCleaner for DefaultConversationsCleaner {
    fn delete_conversations(
        &self,
        tx: &Transaction<'_>,
        subject: Option<EntityId>,
        twincode: Option<EntityId>,
    ) -> Result<()> {
        let (predicate, values): (&str, Vec<i64>) = match (subject, twincode) {
            (Some(subject), Some(twincode)) => (
                "subject_id = ?1 AND peer_twincode_id = ?2",
                vec![subject.value, twincode.value],
            ),
            (Some(subject), None) => ("subject_id = ?1", vec![subject.value]),
            (None, Some(twincode)) => ("peer_twincode_id = ?1", vec![twincode.value]),
            (None, None) => return Ok(()),
        };
        let selected = format!("SELECT id FROM conversation WHERE {}", predicate);

        tx.execute(
            &format!(
                "DELETE FROM annotation WHERE descriptor_id IN \
                 (SELECT id FROM descriptor WHERE conversation_id IN ({}))",
                selected
            ),
            params_from_iter(values.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM descriptor WHERE conversation_id IN ({})", selected),
            params_from_iter(values.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM operation WHERE conversation_id IN ({})", selected),
            params_from_iter(values.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM invitation WHERE conversation_id IN ({})", selected),
            params_from_iter(values.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM conversation WHERE {}", predicate),
            params_from_iter(values.iter()),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;
    use rusqlite::params;

    /// Seed one conversation with a descriptor, an annotation, an
    /// operation, and an invitation, returning the conversation id.
    fn seed_conversation(store: &ObjectStore, subject: i64, peer: i64) -> i64 {
        store
            .with_transaction(|tx| {
                let conversation = tx.allocate_id(EntityKind::Conversation)?;
                tx.execute(
                    "INSERT INTO conversation \
                     (id, uuid, subject_id, peer_twincode_id, flags, modification_date) \
                     VALUES (?1, randomblob(16), ?2, ?3, 0, 0)",
                    params![conversation.value, subject, peer],
                )?;
                let descriptor = tx.allocate_id(EntityKind::Descriptor)?;
                tx.execute(
                    "INSERT INTO descriptor \
                     (id, conversation_id, sequence_id, kind, flags, creation_date, modification_date) \
                     VALUES (?1, ?2, 1, 0, 0, 0, 0)",
                    params![descriptor.value, conversation.value],
                )?;
                tx.execute(
                    "INSERT INTO annotation (descriptor_id, twincode_id, kind) VALUES (?1, ?2, 0)",
                    params![descriptor.value, peer],
                )?;
                let operation = tx.allocate_id(EntityKind::Operation)?;
                tx.execute(
                    "INSERT INTO operation (id, conversation_id, descriptor_id, kind, creation_date) \
                     VALUES (?1, ?2, ?3, 0, 0)",
                    params![operation.value, conversation.value, descriptor.value],
                )?;
                let invitation = tx.allocate_id(EntityKind::Invitation)?;
                tx.execute(
                    "INSERT INTO invitation (id, uuid, conversation_id, twincode_id, flags, creation_date) \
                     VALUES (?1, randomblob(16), ?2, ?3, 0, 0)",
                    params![invitation.value, conversation.value, peer],
                )?;
                Ok(conversation.value)
            })
            .unwrap()
    }

    fn count(store: &ObjectStore, table: &str) -> i64 {
        store
            .long_query(&format!("SELECT COUNT(*) FROM {}", table), [])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_delete_by_subject_cascades_every_table() {
        let store = ObjectStore::open_in_memory().unwrap();
        seed_conversation(&store, 1, 10);
        seed_conversation(&store, 2, 20);

        store
            .with_transaction(|tx| {
                tx.delete_conversations(Some(EntityId::new(EntityKind::Repository, 1)), None)
            })
            .unwrap();

        // The other subject's conversation survives untouched.
        assert_eq!(count(&store, "conversation"), 1);
        assert_eq!(count(&store, "descriptor"), 1);
        assert_eq!(count(&store, "annotation"), 1);
        assert_eq!(count(&store, "operation"), 1);
        assert_eq!(count(&store, "invitation"), 1);
        let remaining = store
            .long_query("SELECT subject_id FROM conversation", [])
            .unwrap();
        assert_eq!(remaining, Some(2));
    }

    #[test]
    fn test_delete_by_twincode_only() {
        let store = ObjectStore::open_in_memory().unwrap();
        seed_conversation(&store, 1, 10);
        seed_conversation(&store, 1, 20);

        store
            .with_transaction(|tx| {
                tx.delete_conversations(None, Some(EntityId::new(EntityKind::TwincodeInbound, 20)))
            })
            .unwrap();

        assert_eq!(count(&store, "conversation"), 1);
        let remaining = store
            .long_query("SELECT peer_twincode_id FROM conversation", [])
            .unwrap();
        assert_eq!(remaining, Some(10));
    }

    #[test]
    fn test_no_selection_deletes_nothing() {
        let store = ObjectStore::open_in_memory().unwrap();
        seed_conversation(&store, 1, 10);
        store
            .with_transaction(|tx| tx.delete_conversations(None, None))
            .unwrap();
        assert_eq!(count(&store, "conversation"), 1);
    }
}
