//! Client error types.
//!
//! [`SyncError`] is the central error type of the crate. Transport, codec
//! and RPC paths return it with `?`; the connection manager logs it and
//! degrades to "stay in the current state, retry later" instead of
//! handing it to its own callers.

/// Client-side error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category   |
/// |-----------|------------|
/// | 1000–1999 | Connection |
/// | 2000–2999 | RPC        |
/// | 3000–3999 | Protocol   |
/// | 4000–4999 | Config     |
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// An operation needed a live connection and there was none.
    #[error("not connected")]
    NotConnected,

    /// The underlying socket failed to open, read or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// The hub rejected or never answered the protocol handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A hub method invocation completed with an error.
    #[error("rpc {method} failed: {message}")]
    Rpc {
        /// Hub method name.
        method: String,
        /// Error text returned by the hub or the transport.
        message: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection closed while the operation was pending.
    #[error("connection closed{}", .0.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    Closed(Option<String>),

    /// The session was stopped; late results are discarded.
    #[error("session stopped")]
    Stopped,

    /// A configuration value could not be parsed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::NotConnected => 1001,
            Self::Transport(_) => 1002,
            Self::Closed(_) => 1003,
            Self::Stopped => 1004,
            Self::Rpc { .. } => 2001,
            Self::Handshake(_) => 3001,
            Self::Protocol(_) => 3002,
            Self::InvalidConfig(_) => 4001,
        }
    }

    /// Returns a short category name, used as a structured log field.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::NotConnected | Self::Transport(_) | Self::Closed(_) | Self::Stopped => {
                "connection"
            }
            Self::Rpc { .. } => "rpc",
            Self::Handshake(_) | Self::Protocol(_) => "protocol",
            Self::InvalidConfig(_) => "config",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
