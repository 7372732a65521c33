//! Server push events consumed from the chat hub.
//!
//! Each push arrives as a named invocation carrying one JSON argument.
//! [`HubEvent::parse`] turns it into a typed event; payloads that do not
//! have the expected shape are rejected with `None` and dropped upstream.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::RoomId;

/// Names of the push events the client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEventKind {
    /// A new message was posted in a room.
    ReceiveUserMessage,
    /// A message was edited.
    UpdateUserMessage,
    /// A message was revoked.
    RevokeUserMessage,
    /// A group chat was created.
    GroupChatCreated,
    /// A one-to-one chat was created.
    UserVsUserChatCreated,
    /// Room metadata changed.
    RoomChatUpdated,
    /// A group chat was removed.
    GroupChatRemoved,
    /// Aggregate unread-rooms / friend-request counters.
    RoomChatAndFriendRequestReceived,
    /// Per-room unread counters for every member.
    UnreadCountChanged,
}

impl HubEventKind {
    /// Every kind, in registration order.
    pub const ALL: [Self; 9] = [
        Self::ReceiveUserMessage,
        Self::UpdateUserMessage,
        Self::RevokeUserMessage,
        Self::GroupChatCreated,
        Self::UserVsUserChatCreated,
        Self::RoomChatUpdated,
        Self::GroupChatRemoved,
        Self::RoomChatAndFriendRequestReceived,
        Self::UnreadCountChanged,
    ];

    /// Returns the hub method name of this event.
    #[must_use]
    pub const fn target(self) -> &'static str {
        match self {
            Self::ReceiveUserMessage => "ReceiveUserMessage",
            Self::UpdateUserMessage => "UpdateUserMessage",
            Self::RevokeUserMessage => "RevokeUserMessage",
            Self::GroupChatCreated => "GroupChatCreated",
            Self::UserVsUserChatCreated => "UserVsUserChatCreated",
            Self::RoomChatUpdated => "RoomChatUpdated",
            Self::GroupChatRemoved => "GroupChatRemoved",
            Self::RoomChatAndFriendRequestReceived => "RoomChatAndFriendRequestReceived",
            Self::UnreadCountChanged => "UnreadCountChanged",
        }
    }

    /// Resolves a hub method name. Matching is ASCII case-insensitive,
    /// the way the hub protocol binds handlers.
    #[must_use]
    pub fn from_target(target: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.target().eq_ignore_ascii_case(target))
    }
}

/// A chat message payload, kept as raw JSON so the store receives every
/// field the hub sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChatMessage(Value);

impl ChatMessage {
    /// Wraps a raw message payload.
    #[must_use]
    pub const fn new(raw: Value) -> Self {
        Self(raw)
    }

    /// Resolves the room this message belongs to: `chatInfo.code` first,
    /// then the top-level `roomId`.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.0
            .get("chatInfo")
            .and_then(|info| info.get("code"))
            .and_then(RoomId::from_json)
            .or_else(|| self.0.get("roomId").and_then(RoomId::from_json))
    }

    /// Returns `false` only when the payload explicitly carries
    /// `isNotifyRoomChat: false` (a silent edit).
    #[must_use]
    pub fn notifies_room_list(&self) -> bool {
        self.0.get("isNotifyRoomChat").and_then(Value::as_bool) != Some(false)
    }

    /// Returns the raw payload.
    #[must_use]
    pub const fn as_json(&self) -> &Value {
        &self.0
    }
}

/// Aggregate notification counters for the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCounts {
    /// User the counters belong to.
    pub user_id: i64,
    /// Number of rooms with unread messages.
    pub unread_rooms_count: u64,
    /// Number of pending incoming friend requests.
    pub pending_friend_requests_count: u64,
}

impl NotificationCounts {
    /// Reads the counters from a payload object; missing or non-numeric
    /// fields read as zero. Non-object payloads are rejected.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let int = |key: &str| object.get(key).and_then(Value::as_i64).unwrap_or(0);
        let count = |key: &str| object.get(key).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            user_id: int("userId"),
            unread_rooms_count: count("unreadRoomsCount"),
            pending_friend_requests_count: count("pendingFriendRequestsCount"),
        })
    }
}

/// Unread counters of one room, keyed by member user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCounts {
    /// Room the counters belong to.
    pub room_id: RoomId,
    /// Unread count per user id.
    pub per_user: HashMap<String, u64>,
}

impl UnreadCounts {
    /// Reads `chatCode` and `allUnreadCounts` from a payload. Entries that
    /// are not non-negative integers (or numeric strings) are skipped.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let room_id = value.get("chatCode").and_then(RoomId::from_json)?;
        let per_user = value
            .get("allUnreadCounts")
            .and_then(Value::as_object)
            .map(|counts| {
                counts
                    .iter()
                    .filter_map(|(user, count)| {
                        let count = count
                            .as_u64()
                            .or_else(|| count.as_str().and_then(|s| s.parse().ok()))?;
                        Some((user.clone(), count))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { room_id, per_user })
    }

    /// Returns the count for `user_id`, zero if the user is absent.
    #[must_use]
    pub fn count_for(&self, user_id: &str) -> u64 {
        self.per_user.get(user_id).copied().unwrap_or(0)
    }
}

/// Typed server push event.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// A new message was posted.
    MessageReceived(ChatMessage),
    /// A message was edited.
    MessageUpdated(ChatMessage),
    /// A message was revoked.
    MessageRevoked(ChatMessage),
    /// The room list changed structurally (created, removed, updated).
    RoomListChanged(HubEventKind),
    /// Aggregate notification counters.
    NotificationCounts(NotificationCounts),
    /// Per-room unread counters.
    UnreadCountChanged(UnreadCounts),
}

impl HubEvent {
    /// Parses a push invocation into a typed event.
    ///
    /// Returns `None` for unknown targets and for payloads whose shape
    /// does not match the event.
    #[must_use]
    pub fn parse(target: &str, arguments: &[Value]) -> Option<Self> {
        let kind = HubEventKind::from_target(target)?;
        let payload = arguments.first().unwrap_or(&Value::Null);
        match kind {
            HubEventKind::ReceiveUserMessage => message(payload).map(Self::MessageReceived),
            HubEventKind::UpdateUserMessage => message(payload).map(Self::MessageUpdated),
            HubEventKind::RevokeUserMessage => message(payload).map(Self::MessageRevoked),
            HubEventKind::GroupChatCreated
            | HubEventKind::UserVsUserChatCreated
            | HubEventKind::RoomChatUpdated
            | HubEventKind::GroupChatRemoved => Some(Self::RoomListChanged(kind)),
            HubEventKind::RoomChatAndFriendRequestReceived => {
                NotificationCounts::from_json(payload).map(Self::NotificationCounts)
            }
            HubEventKind::UnreadCountChanged => {
                UnreadCounts::from_json(payload).map(Self::UnreadCountChanged)
            }
        }
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => "message_received",
            Self::MessageUpdated(_) => "message_updated",
            Self::MessageRevoked(_) => "message_revoked",
            Self::RoomListChanged(_) => "room_list_changed",
            Self::NotificationCounts(_) => "notification_counts",
            Self::UnreadCountChanged(_) => "unread_count_changed",
        }
    }
}

fn message(payload: &Value) -> Option<ChatMessage> {
    payload.is_object().then(|| ChatMessage::new(payload.clone()))
}
