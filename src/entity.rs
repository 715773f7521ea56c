//! Entity model - identifiers and the persisted-object contract
//!
//! Every stored object has exactly one `EntityId`: the pair of its
//! `EntityKind` (the table it lives in) and a numeric id allocated by
//! the per-kind sequence. The id doubles as the identity-cache key and
//! as the foreign-key value embedded in other rows.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::{Result, StorageError};

/// Closed enumeration of the persisted tables.
///
/// New feature modules extend the store by adding a kind here together
/// with a schema provider and, when the kind is materialized as an
/// in-memory object, an `ObjectFactory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// Paired counterpart of a peer identity
    TwincodeInbound,
    /// Local projection of an identity exchanged with peers
    TwincodeOutbound,
    /// Signing/encryption key material attached to a twincode
    TwincodeKeys,
    /// Shared secrets negotiated with peer twincodes
    SecretKeys,
    /// Schema-UUID-keyed domain objects (contacts, groups, profiles)
    Repository,
    Notification,
    Conversation,
    /// Pending outbound conversation work items
    Operation,
    /// A single conversation event (message, call, ...)
    Descriptor,
    /// Per-descriptor per-peer marks (reactions, read receipts)
    Annotation,
    Invitation,
    /// The shared id-counter table itself
    Sequence,
    Image,
}

impl EntityKind {
    /// Get the canonical string representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TwincodeInbound => "twincode-inbound",
            EntityKind::TwincodeOutbound => "twincode-outbound",
            EntityKind::TwincodeKeys => "twincode-keys",
            EntityKind::SecretKeys => "secret-keys",
            EntityKind::Repository => "repository",
            EntityKind::Notification => "notification",
            EntityKind::Conversation => "conversation",
            EntityKind::Operation => "operation",
            EntityKind::Descriptor => "descriptor",
            EntityKind::Annotation => "annotation",
            EntityKind::Invitation => "invitation",
            EntityKind::Sequence => "sequence",
            EntityKind::Image => "image",
        }
    }

    /// Get the SQL table backing this kind
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::TwincodeInbound => "twincode_inbound",
            EntityKind::TwincodeOutbound => "twincode_outbound",
            EntityKind::TwincodeKeys => "twincode_keys",
            EntityKind::SecretKeys => "secret_keys",
            EntityKind::Repository => "repository",
            EntityKind::Notification => "notification",
            EntityKind::Conversation => "conversation",
            EntityKind::Operation => "operation",
            EntityKind::Descriptor => "descriptor",
            EntityKind::Annotation => "annotation",
            EntityKind::Invitation => "invitation",
            EntityKind::Sequence => "sequence",
            EntityKind::Image => "image",
        }
    }

    /// Name of this kind's row in the shared sequence table
    pub fn sequence_name(&self) -> &'static str {
        self.table()
    }

    /// Whether numeric ids for this kind come from the shared sequence.
    /// The sequence table itself is keyed by name and has no allocator.
    pub fn has_sequence(&self) -> bool {
        !matches!(self, EntityKind::Sequence)
    }

    /// Get all entity kinds
    pub fn all() -> &'static [EntityKind] {
        &[
            EntityKind::TwincodeInbound,
            EntityKind::TwincodeOutbound,
            EntityKind::TwincodeKeys,
            EntityKind::SecretKeys,
            EntityKind::Repository,
            EntityKind::Notification,
            EntityKind::Conversation,
            EntityKind::Operation,
            EntityKind::Descriptor,
            EntityKind::Annotation,
            EntityKind::Invitation,
            EntityKind::Sequence,
            EntityKind::Image,
        ]
    }
}

impl FromStr for EntityKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.table() == s)
            .ok_or_else(|| StorageError::InvalidKind(s.to_string()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a persisted entity: kind + numeric id.
///
/// Numeric ids are `i64` to match SQLite INTEGER columns; the sequence
/// allocator starts at 1 and only moves forward, so ids are always
/// positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub value: i64,
}

impl EntityId {
    pub fn new(kind: EntityKind, value: i64) -> Self {
        Self { kind, value }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.value)
    }
}

/// Row flag: the entity is logically deleted and must be treated as
/// not found by loads until its cleanup runs.
pub const FLAG_DELETED: u32 = 0x0001;

/// Contract every stored object implements.
///
/// Instances are shared by reference through the identity cache with
/// process lifetime; mutable state lives behind interior locks so a
/// cached instance can be refreshed in place from a fresh row.
pub trait PersistedEntity: fmt::Debug + Send + Sync {
    /// The unique identifier of this entity
    fn id(&self) -> EntityId;

    /// Secondary lookup key, when the kind carries one
    fn uuid(&self) -> Option<Uuid>;

    /// Logical subtype tag for repository objects (contact, group, ...)
    fn schema_id(&self) -> Option<Uuid> {
        None
    }

    /// Modification stamp (epoch millis) used to detect stale cache entries
    fn modified(&self) -> i64;

    /// Upcast for typed retrieval out of the identity cache
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ========== Attributes ==========

/// A single typed attribute value attached to an entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Long(i64),
    Bool(bool),
    Uuid(Uuid),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            AttributeValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            AttributeValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

/// Named attribute set serialized as a JSON TEXT column.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Serialize an attribute map for storage.
pub fn encode_attributes(attributes: &AttributeMap) -> Result<String> {
    serde_json::to_string(attributes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Parse an attribute column. `None` means the row is unreadable and
/// the entity must be treated as not found.
pub fn decode_attributes(raw: &str) -> Option<AttributeMap> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in EntityKind::all() {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(*kind, parsed);
        }
    }

    #[test]
    fn test_kind_table_names_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in EntityKind::all() {
            assert!(seen.insert(kind.table()), "duplicate table {}", kind.table());
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(EntityKind::from_str("message").is_err());
    }

    #[test]
    fn test_entity_id_display() {
        let id = EntityId::new(EntityKind::TwincodeOutbound, 42);
        assert_eq!(id.to_string(), "twincode-outbound/42");
    }

    #[test]
    fn test_attributes_roundtrip() {
        let mut attributes = AttributeMap::new();
        attributes.insert("name".to_string(), AttributeValue::String("Alice".to_string()));
        attributes.insert("capabilities".to_string(), AttributeValue::Long(7));
        attributes.insert("certified".to_string(), AttributeValue::Bool(true));
        attributes.insert(
            "avatarId".to_string(),
            AttributeValue::Uuid(Uuid::new_v4()),
        );

        let raw = encode_attributes(&attributes).unwrap();
        let decoded = decode_attributes(&raw).unwrap();
        assert_eq!(decoded, attributes);
        assert_eq!(decoded.get("name").unwrap().as_str(), Some("Alice"));
        assert_eq!(decoded.get("capabilities").unwrap().as_long(), Some(7));
    }

    #[test]
    fn test_unreadable_attributes() {
        assert!(decode_attributes("not json").is_none());
        assert!(decode_attributes("{\"name\":{\"Float\":1.5}}").is_none());
    }
}
