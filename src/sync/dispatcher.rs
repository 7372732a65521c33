//! Inbound event normalization and deduplication.
//!
//! [`EventDispatcher`] turns typed [`HubEvent`]s into the
//! [`StoreUpdate`]s the shared store should receive. It owns the unread
//! cache and the notification counts snapshot, and suppresses every update
//! whose resolved value equals the last one it forwarded.

use std::collections::HashMap;

use crate::domain::{ChatMessage, HubEvent, NotificationCounts, RoomId};
use crate::store::StoreUpdate;

/// Stateful event-to-update resolver.
#[derive(Debug)]
pub struct EventDispatcher {
    /// Id of the signed-in user.
    user_id: String,
    /// Last unread count forwarded per room.
    unread: HashMap<RoomId, u64>,
    /// Last notification counters forwarded.
    counts: Option<NotificationCounts>,
}

impl EventDispatcher {
    /// Creates a dispatcher for `user_id` with empty caches.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            unread: HashMap::new(),
            counts: None,
        }
    }

    /// Resolves one event into zero or more store updates, in the order
    /// they must be applied.
    pub fn dispatch(&mut self, event: HubEvent) -> Vec<StoreUpdate> {
        tracing::trace!(event = event.event_type_str(), "dispatching hub event");
        match event {
            HubEvent::MessageReceived(message) => received_updates(message),
            HubEvent::MessageUpdated(message) | HubEvent::MessageRevoked(message) => {
                let notify = message.notifies_room_list();
                edit_updates(message, notify)
            }
            HubEvent::RoomListChanged(kind) => {
                tracing::debug!(event = kind.target(), "room list changed, refetching");
                vec![StoreUpdate::RefetchRooms]
            }
            HubEvent::NotificationCounts(counts) => {
                if self.counts == Some(counts) {
                    tracing::debug!("notification counts unchanged, skipping update");
                    return Vec::new();
                }
                self.counts = Some(counts);
                vec![StoreUpdate::NotificationCounts(counts)]
            }
            HubEvent::UnreadCountChanged(unread) => {
                let count = unread.count_for(&self.user_id);
                let previous = self.unread.insert(unread.room_id.clone(), count);
                if previous == Some(count) {
                    return Vec::new();
                }
                tracing::debug!(room = %unread.room_id, ?previous, count, "unread changed");
                vec![StoreUpdate::RoomUnread {
                    room_id: unread.room_id,
                    count,
                }]
            }
        }
    }

    /// Returns the last unread count forwarded for `room`.
    #[must_use]
    pub fn cached_unread(&self, room: &RoomId) -> Option<u64> {
        self.unread.get(room).copied()
    }

    /// Returns the last notification counters forwarded.
    #[must_use]
    pub const fn cached_counts(&self) -> Option<NotificationCounts> {
        self.counts
    }

    /// Drops both caches so the next values are forwarded unconditionally.
    pub fn reset(&mut self) {
        self.unread.clear();
        self.counts = None;
    }
}

/// A new message moves the room to the top first, then refreshes its
/// metadata.
fn received_updates(message: ChatMessage) -> Vec<StoreUpdate> {
    let Some(room_id) = message.room_id() else {
        tracing::debug!("message without resolvable room dropped");
        return Vec::new();
    };
    vec![
        StoreUpdate::LastMessage {
            room_id,
            message: message.clone(),
        },
        StoreUpdate::RoomFromMessage(message),
    ]
}

/// Edits refresh room metadata first; the last-message update (which
/// reorders the room list) follows and is skipped for silent edits.
fn edit_updates(message: ChatMessage, notify: bool) -> Vec<StoreUpdate> {
    let Some(room_id) = message.room_id() else {
        tracing::debug!("message without resolvable room dropped");
        return Vec::new();
    };
    let mut updates = vec![StoreUpdate::RoomFromMessage(message.clone())];
    if notify {
        updates.push(StoreUpdate::LastMessage { room_id, message });
    }
    updates
}
