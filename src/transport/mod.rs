//! Push transport layer: the hub connection abstraction and its
//! WebSocket implementation.
//!
//! The connection manager never talks to a socket directly. It creates a
//! [`HubTransport`] per session through a [`TransportFactory`], drives its
//! `start()` / `stop()` lifecycle, issues RPCs through `invoke()`, and
//! consumes server pushes and lifecycle callbacks as [`TransportEvent`]s
//! from a single ordered channel.

pub mod protocol;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::ConnectionState;
use crate::error::SyncError;

pub use ws::{WsHubTransport, WsTransportFactory};

/// Hub method that subscribes the connection to one room.
pub const JOIN_ROOM: &str = "JoinChatUserRoom";
/// Hub method that unsubscribes the connection from one room.
pub const LEAVE_ROOM: &str = "LeaveChatUserRoom";
/// Hub method that subscribes the connection to user-level notifications.
pub const JOIN_USER_NOTIFY: &str = "JoinUserNotify";
/// Hub method that marks a room as actively viewed.
pub const PING_ACTIVE_ROOM: &str = "PingActiveRoom";
/// Hub method that marks a room as no longer viewed.
pub const SET_INACTIVE_IN_ROOM: &str = "SetInactiveInRoom";

/// Everything a transport reports back to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A server push invocation.
    Invocation {
        /// Hub method name.
        target: String,
        /// Invocation arguments.
        arguments: Vec<Value>,
    },
    /// The connection dropped and automatic retry began.
    Reconnecting {
        /// Why the connection dropped.
        error: Option<String>,
    },
    /// Automatic retry succeeded.
    Reconnected {
        /// Id of the new underlying connection.
        connection_id: Option<String>,
    },
    /// The connection closed for good (retries exhausted or refused).
    Closed {
        /// Why the connection closed.
        error: Option<String>,
    },
}

/// Sender half handed to a transport for reporting [`TransportEvent`]s.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A bidirectional push transport to the chat hub.
#[async_trait]
pub trait HubTransport: Send + Sync + fmt::Debug {
    /// Opens the connection and completes the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] if the socket cannot be opened or the
    /// handshake is rejected.
    async fn start(&self) -> Result<(), SyncError>;

    /// Closes the connection. No further events are reported, and no
    /// automatic retry runs afterwards.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] if the close frame could not be sent; the
    /// transport is considered stopped regardless.
    async fn stop(&self) -> Result<(), SyncError>;

    /// Invokes a hub method and waits for its completion.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] when not connected,
    /// [`SyncError::Rpc`] when the hub reports a failure, and
    /// [`SyncError::Closed`] if the connection drops first.
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SyncError>;

    /// Returns the transport's current state.
    fn state(&self) -> ConnectionState;

    /// Returns the id of the current underlying connection.
    fn connection_id(&self) -> Option<String>;
}

/// Builds one transport per session.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Creates a transport that reports its events through `events`.
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport>;
}

/// Produces the access token for a connection attempt.
///
/// Evaluated on every (re)connect, never cached, so a refreshed token is
/// picked up by the next attempt.
#[derive(Clone)]
pub struct TokenFactory(Arc<dyn Fn() -> String + Send + Sync>);

impl TokenFactory {
    /// Wraps a token-producing closure.
    pub fn new(factory: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(factory))
    }

    /// A factory that always yields the same token.
    #[must_use]
    pub fn fixed(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::new(move || token.clone())
    }

    /// Evaluates the factory.
    #[must_use]
    pub fn token(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for TokenFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenFactory").finish_non_exhaustive()
    }
}
