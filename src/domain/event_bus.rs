//! Broadcast channel for connection state transitions.
//!
//! [`StateBus`] wraps a [`tokio::sync::broadcast`] channel. The connection
//! manager publishes a [`StateChange`] on every lifecycle transition, and
//! any number of observers (UI, diagnostics) subscribe to it.

use chrono::Utc;
use tokio::sync::broadcast;

use super::{ConnectionState, StateChange};

/// Broadcast bus for [`StateChange`]s.
///
/// When the ring buffer is full, the oldest transitions are dropped for
/// lagging receivers.
#[derive(Debug, Clone)]
pub struct StateBus {
    sender: broadcast::Sender<StateChange>,
}

impl StateBus {
    /// Creates a new `StateBus` with the given channel capacity.
    ///
    /// A capacity of zero is clamped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Stamps a transition with the current time and publishes it to all
    /// subscribers.
    ///
    /// Returns the number of receivers that got it; with no receivers the
    /// transition is silently dropped.
    pub fn publish(&self, state: ConnectionState, connection_id: Option<String>) -> usize {
        self.sender
            .send(StateChange {
                state,
                connection_id,
                timestamp: Utc::now(),
            })
            .unwrap_or(0)
    }

    /// Creates a new receiver for all future transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.sender.subscribe()
    }
}
