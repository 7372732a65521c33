//! Reconnection policy: the backoff schedule handed to the transport and
//! the environmental triggers that resume a connection the transport has
//! given up on.

use std::time::Duration;

use crate::domain::ConnectionState;

/// Fixed, increasing delay sequence between reconnect attempts.
///
/// Attempt `n` (zero-based) waits `delays[n]` before dialing. Once every
/// delay has been used the transport settles into
/// [`ConnectionState::Disconnected`] and needs an external trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl ReconnectPolicy {
    /// Creates a policy from explicit delays.
    #[must_use]
    pub const fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Creates a policy from delays expressed in milliseconds.
    #[must_use]
    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// A policy with no automatic retries: a drop goes straight to
    /// `Disconnected`.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    /// Returns the delay before attempt `attempt`, or `None` once the
    /// schedule is exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    /// Returns the full schedule.
    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Environmental signals that may resume a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentTrigger {
    /// The device regained network connectivity.
    NetworkOnline,
    /// The app returned to the foreground / became visible.
    AppForeground,
}

impl EnvironmentTrigger {
    /// Returns `true` if this trigger should issue a manual `connect()`.
    ///
    /// Only a fully `Disconnected` state qualifies; during `Connecting`
    /// or `Reconnecting` the transport's own retry is already running.
    #[must_use]
    pub const fn should_reconnect(self, state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Disconnected)
    }

    /// Returns the trigger as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkOnline => "network_online",
            Self::AppForeground => "app_foreground",
        }
    }
}
