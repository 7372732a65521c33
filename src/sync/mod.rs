//! Sync layer: connection lifecycle, subscriptions, reconnection and event
//! dispatch.
//!
//! [`ConnectionManager`] is the entry point. It composes a
//! [`SubscriptionTracker`] for the desired/joined room diff, an
//! [`EventDispatcher`] for inbound pushes, a [`ReconnectPolicy`] handed to
//! the transport, and an optional [`PresenceTask`] for the open room.

pub mod dispatcher;
pub mod manager;
pub mod presence;
pub mod reconnect;
pub mod subscription;

pub use dispatcher::EventDispatcher;
pub use manager::ConnectionManager;
pub use presence::PresenceTask;
pub use reconnect::{EnvironmentTrigger, ReconnectPolicy};
pub use subscription::{RoomDiff, SubscriptionTracker};
