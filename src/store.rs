//! Shared application store facade.
//!
//! The store that the UI renders from is an external collaborator. The
//! connection manager receives it as an explicit [`ChatStore`] handle and
//! pushes resolved updates into it as [`StoreUpdate`]s.

use std::fmt;

use crate::domain::{ChatMessage, NotificationCounts, RoomId};

/// Named setters of the shared application store.
///
/// Implementations are called from the manager's event loop, one update
/// at a time and in event order. They must not block.
pub trait ChatStore: Send + Sync + fmt::Debug {
    /// Records the latest message of a room (reorders the room list and
    /// bumps unread state).
    fn update_last_message(&self, room_id: &RoomId, message: &ChatMessage);

    /// Refreshes room metadata (title, preview, timestamps) from a
    /// message.
    fn update_chat_room_from_message(&self, message: &ChatMessage);

    /// Sets the unread count of a room for the signed-in user.
    fn set_room_unread(&self, room_id: &RoomId, count: u64);

    /// Replaces the aggregate notification counters.
    fn set_notification_counts(&self, counts: NotificationCounts);

    /// Re-fetches the full room list from the backend.
    fn refetch_chat_rooms(&self);
}

/// A resolved update for the shared store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// See [`ChatStore::update_last_message`].
    LastMessage {
        /// Room the message belongs to.
        room_id: RoomId,
        /// The message payload.
        message: ChatMessage,
    },
    /// See [`ChatStore::update_chat_room_from_message`].
    RoomFromMessage(ChatMessage),
    /// See [`ChatStore::set_room_unread`].
    RoomUnread {
        /// Room whose counter changed.
        room_id: RoomId,
        /// New count for the signed-in user.
        count: u64,
    },
    /// See [`ChatStore::set_notification_counts`].
    NotificationCounts(NotificationCounts),
    /// See [`ChatStore::refetch_chat_rooms`].
    RefetchRooms,
}

impl StoreUpdate {
    /// Applies this update to `store`.
    pub fn apply(&self, store: &dyn ChatStore) {
        match self {
            Self::LastMessage { room_id, message } => store.update_last_message(room_id, message),
            Self::RoomFromMessage(message) => store.update_chat_room_from_message(message),
            Self::RoomUnread { room_id, count } => store.set_room_unread(room_id, *count),
            Self::NotificationCounts(counts) => store.set_notification_counts(*counts),
            Self::RefetchRooms => store.refetch_chat_rooms(),
        }
    }
}

/// A store that only logs what it receives. Used by the binary when no
/// UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStore;

impl ChatStore for TracingStore {
    fn update_last_message(&self, room_id: &RoomId, message: &ChatMessage) {
        let code = message.as_json().get("code").and_then(|c| c.as_str());
        tracing::info!(room = %room_id, message = ?code, "last message updated");
    }

    fn update_chat_room_from_message(&self, message: &ChatMessage) {
        tracing::info!(room = ?message.room_id().map(|r| r.to_string()), "room metadata updated");
    }

    fn set_room_unread(&self, room_id: &RoomId, count: u64) {
        tracing::info!(room = %room_id, count, "room unread updated");
    }

    fn set_notification_counts(&self, counts: NotificationCounts) {
        tracing::info!(
            user_id = counts.user_id,
            unread_rooms = counts.unread_rooms_count,
            pending_friend_requests = counts.pending_friend_requests_count,
            "notification counts updated"
        );
    }

    fn refetch_chat_rooms(&self) {
        tracing::info!("room list refetch requested");
    }
}
