//! Domain layer: room identity, connection states, and hub events.
//!
//! This module contains the client-side domain model: the opaque room
//! identifier, the connection lifecycle states with the bus that
//! broadcasts their transitions, and the typed server push events.

pub mod connection_state;
pub mod event_bus;
pub mod hub_event;
pub mod room_id;

pub use connection_state::{ConnectionState, StateChange};
pub use event_bus::StateBus;
pub use hub_event::{ChatMessage, HubEvent, HubEventKind, NotificationCounts, UnreadCounts};
pub use room_id::RoomId;
