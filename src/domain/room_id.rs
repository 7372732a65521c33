//! Type-safe chat room identifier.
//!
//! [`RoomId`] wraps the opaque room code the hub assigns to a chat room
//! so that room codes cannot be confused with user ids or message codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a chat room.
///
/// The hub addresses rooms by their string code; the client never
/// inspects its structure. Used as the key of the joined set, the unread
/// cache, and as the argument of `JoinChatUserRoom` / `LeaveChatUserRoom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Creates a `RoomId` from any string-like value.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Returns the room code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a room id out of a JSON value. Numeric ids are accepted in
    /// their decimal form; empty strings and other values are rejected.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self::new(s.as_str())),
            serde_json::Value::Number(n) => Some(Self::new(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for RoomId {
    fn from(code: String) -> Self {
        Self(code)
    }
}

impl From<RoomId> for serde_json::Value {
    fn from(id: RoomId) -> Self {
        Self::String(id.0)
    }
}
