//! # room-sync
//!
//! Real-time room membership and event synchronization client for a chat
//! hub.
//!
//! This crate keeps a client's local view of many concurrent chat rooms
//! and notification counters consistent with a server-pushed event stream
//! over an unreliable network. Rendering and REST lookups are someone
//! else's job: resolved updates are pushed into an injected
//! [`store::ChatStore`].
//!
//! ## Architecture
//!
//! ```text
//! UI (desired rooms, triggers)
//!     │
//!     ├── ConnectionManager (sync/)
//!     │       ├── SubscriptionTracker   desired vs joined diff
//!     │       ├── EventDispatcher       normalize + dedup
//!     │       ├── PresenceTask          active-room pings
//!     │       └── StateBus (domain/)    state transitions
//!     │
//!     ├── HubTransport (transport/)
//!     │       └── WsHubTransport        JSON hub protocol, backoff
//!     │
//!     └── ChatStore (store)             shared application store
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod domain;
pub mod error;
pub mod store;
pub mod sync;
pub mod transport;

/// Locks a std mutex, recovering the data if a previous holder panicked.
///
/// Guarded sections in this crate never leave state half-updated, so a
/// poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
