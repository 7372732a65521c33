//! Connection lifecycle states and the transitions published for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the hub connection.
///
/// ```text
/// Disconnected --connect()--> Connecting --success--> Connected
/// Connected --drop--> Reconnecting --success--> Connected
/// Reconnecting --exhausted--> Disconnected
/// Connected --stop()--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, or the transport gave up retrying.
    #[default]
    Disconnected,
    /// First `start()` of a session is in flight.
    Connecting,
    /// Transport is live; RPCs may be issued.
    Connected,
    /// Transport dropped and is walking its backoff schedule.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` while a session exists, i.e. a new `connect()` must
    /// reuse it instead of starting another transport.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Returns the state as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// A published connection state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// State entered.
    pub state: ConnectionState,
    /// Connection id of the live transport, if any.
    pub connection_id: Option<String>,
    /// When the transition was observed.
    pub timestamp: DateTime<Utc>,
}
