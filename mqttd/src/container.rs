//! Registry slot of one client id.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::expiry::Expiry;
use crate::router::Subscriber;
use crate::session::Session;
use crate::types::ProtocolVersion;

/// Stable handle stored in the registry map.
///
/// Ownership moves between sessions by rewriting the slot in place, so
/// anyone holding the `Arc` keeps seeing the current owner.
#[derive(Default)]
pub(crate) struct Container {
    pub(crate) slot: Mutex<Slot>,
}

pub(crate) struct Slot {
    /// Session attached to a live connection.
    pub(crate) session: Option<Arc<Session>>,
    /// Pending expiry timer while no session is attached.
    pub(crate) expiry: Option<Arc<Expiry>>,
    /// Router handle that outlives connections of durable sessions.
    pub(crate) subscriber: Option<Arc<dyn Subscriber>>,
    /// Protocol version the subscriptions were made with.
    pub(crate) version: ProtocolVersion,
    /// The current owner connected with clean start.
    pub(crate) clean_start: bool,
    /// Cleared while a takeover is in progress.
    pub(crate) removable: bool,
    /// Set once the container has been evicted from the registry.
    pub(crate) removed: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            session: None,
            expiry: None,
            subscriber: None,
            version: ProtocolVersion::default(),
            clean_start: false,
            removable: true,
            removed: false,
        }
    }
}

impl Slot {
    /// Whether `session` is the one attached to this slot.
    pub(crate) fn owned_by(&self, session: &Arc<Session>) -> bool {
        self.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session))
    }

    /// Nothing left that needs the slot.
    pub(crate) fn is_vacant(&self) -> bool {
        self.session.is_none() && self.expiry.is_none() && self.subscriber.is_none()
    }
}
