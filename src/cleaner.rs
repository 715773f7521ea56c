//! Cleaner capabilities - cascading-delete seams between feature modules
//!
//! A module that triggers a delete does not depend on the modules that
//! must cascade: it calls through the transaction, which forwards to
//! whichever cleaner is registered. The registry is an explicit struct
//! of optional handler slots populated once at service startup; an
//! empty slot makes the forwarded call a no-op.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::transaction::Transaction;
use crate::twincode::TwincodeOutbound;
use crate::Result;

/// Deletes conversations (and their descriptors, operations,
/// annotations, and invitations) selected by subject and/or peer
/// twincode.
pub trait ConversationsCleaner: Send + Sync {
    fn delete_conversations(
        &self,
        tx: &Transaction<'_>,
        subject: Option<EntityId>,
        twincode: Option<EntityId>,
    ) -> Result<()>;
}

/// Deletes notifications attached to a subject, optionally narrowed to
/// one peer twincode and/or one descriptor.
pub trait NotificationsCleaner: Send + Sync {
    fn delete_notifications(
        &self,
        tx: &Transaction<'_>,
        subject: EntityId,
        twincode: Option<EntityId>,
        descriptor: Option<EntityId>,
    ) -> Result<()>;
}

/// Deletes a stored image.
pub trait ImagesCleaner: Send + Sync {
    fn delete_image(&self, tx: &Transaction<'_>, image: EntityId) -> Result<()>;
}

/// Deletes a twincode together with its key material and secrets.
pub trait TwincodesCleaner: Send + Sync {
    fn delete_twincode(&self, tx: &Transaction<'_>, twincode: &Arc<TwincodeOutbound>)
        -> Result<()>;
}

#[derive(Default)]
struct Slots {
    conversations: Option<Arc<dyn ConversationsCleaner>>,
    notifications: Option<Arc<dyn NotificationsCleaner>>,
    images: Option<Arc<dyn ImagesCleaner>>,
    twincodes: Option<Arc<dyn TwincodesCleaner>>,
}

/// Optional cleaner slots, registered once at service startup.
#[derive(Default)]
pub struct CleanerRegistry {
    slots: RwLock<Slots>,
}

impl CleanerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversations(&self, cleaner: Arc<dyn ConversationsCleaner>) {
        self.slots.write().conversations = Some(cleaner);
    }

    pub fn set_notifications(&self, cleaner: Arc<dyn NotificationsCleaner>) {
        self.slots.write().notifications = Some(cleaner);
    }

    pub fn set_images(&self, cleaner: Arc<dyn ImagesCleaner>) {
        self.slots.write().images = Some(cleaner);
    }

    pub fn set_twincodes(&self, cleaner: Arc<dyn TwincodesCleaner>) {
        self.slots.write().twincodes = Some(cleaner);
    }

    pub fn conversations(&self) -> Option<Arc<dyn ConversationsCleaner>> {
        self.slots.read().conversations.clone()
    }

    pub fn notifications(&self) -> Option<Arc<dyn NotificationsCleaner>> {
        self.slots.read().notifications.clone()
    }

    pub fn images(&self) -> Option<Arc<dyn ImagesCleaner>> {
        self.slots.read().images.clone()
    }

    pub fn twincodes(&self) -> Option<Arc<dyn TwincodesCleaner>> {
        self.slots.read().twincodes.clone()
    }
}
