//! Delivery bridge: turns push frames and local events into inbox records.
//!
//! A frame is only delivered if the connection that received it belongs to
//! the current session epoch and the frame is addressed to the current
//! user. Everything else is dropped, which is what keeps a notification
//! for the previous user from showing up after a logout/login race.

use crate::notifications::{generate_id, NotificationKind, NotificationRecord, Priority, SharedInbox};
use crate::push::StampedFrame;
use crate::session::SessionStore;

/// What happened to a frame handed to [`DeliveryBridge::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Inserted into the inbox under this id.
    Delivered(String),
    /// An entry with the same id is already present.
    Duplicate(String),
    /// The frame arrived on a connection from an earlier epoch.
    StaleEpoch {
        /// Epoch the frame was stamped with.
        frame: u64,
        /// Session epoch at delivery time.
        current: u64,
    },
    /// Addressed to a different user.
    NotAddressed,
    /// No validated profile to match the addressee against.
    NoProfile,
}

/// Routes notifications into the inbox.
#[derive(Debug, Clone)]
pub struct DeliveryBridge {
    session: SessionStore,
    inbox: SharedInbox,
}

impl DeliveryBridge {
    /// Bridge between `session` and `inbox`.
    pub fn new(session: SessionStore, inbox: SharedInbox) -> Self {
        Self { session, inbox }
    }

    /// Deliver one push frame.
    ///
    /// Frames without a server id get a fresh one, so they are never
    /// deduplicated against each other.
    pub fn deliver(&self, stamped: StampedFrame) -> DeliveryOutcome {
        let current = self.session.epoch();
        if stamped.epoch != current {
            log::debug!(
                "[Bridge] Dropping frame from epoch {} (current {})",
                stamped.epoch,
                current
            );
            return DeliveryOutcome::StaleEpoch {
                frame: stamped.epoch,
                current,
            };
        }

        let Some(profile) = self.session.profile() else {
            log::debug!("[Bridge] Dropping frame, no validated profile");
            return DeliveryOutcome::NoProfile;
        };
        let frame = stamped.frame;
        if frame.user_id != profile.id {
            log::debug!("[Bridge] Dropping frame addressed to user {}", frame.user_id);
            return DeliveryOutcome::NotAddressed;
        }

        let id = frame.id.unwrap_or_else(generate_id);
        let mut record = NotificationRecord::new(id.clone(), frame.category, frame.message, frame.priority);
        record.timestamp = stamped.received_at;

        let mut inbox = match self.inbox.write() {
            Ok(inbox) => inbox,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the inbox lock: a logout that cleared the inbox
        // after the first check must not be followed by this insert.
        if self.session.epoch() != current {
            return DeliveryOutcome::StaleEpoch {
                frame: stamped.epoch,
                current: self.session.epoch(),
            };
        }
        inbox.enter_epoch(current);
        if inbox.add(record) {
            log::info!(
                "[Bridge] Delivered {} notification {} (unread {})",
                frame.category,
                id,
                inbox.unread_count()
            );
            DeliveryOutcome::Delivered(id)
        } else {
            DeliveryOutcome::Duplicate(id)
        }
    }

    /// Add a notification raised by the client itself (an API error, a
    /// completed action). Returns the generated id.
    ///
    /// The record is stamped with the current session epoch, so it stays
    /// until dismissed or until a later epoch begins.
    pub fn notify_local(
        &self,
        kind: NotificationKind,
        message: impl Into<String>,
        priority: Priority,
    ) -> String {
        let record = NotificationRecord::local(kind, message, priority);
        let id = record.id.clone();
        let mut inbox = match self.inbox.write() {
            Ok(inbox) => inbox,
            Err(poisoned) => poisoned.into_inner(),
        };
        inbox.enter_epoch(self.session.epoch());
        inbox.add(record);
        log::debug!("[Bridge] Local {} notification {}", kind, id);
        id
    }
}
