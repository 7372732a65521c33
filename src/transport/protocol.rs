//! JSON hub protocol framing.
//!
//! Every message is a JSON object terminated by the ASCII record
//! separator (`0x1E`); one WebSocket text frame may carry several. The
//! connection opens with a handshake exchange, after which messages are
//! discriminated by their numeric `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SyncError;

/// Terminator of every protocol message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// First message a client sends after the socket opens.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    /// Protocol name, always `"json"`.
    pub protocol: &'static str,
    /// Protocol version, always `1`.
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json",
            version: 1,
        }
    }
}

/// The hub's answer to [`HandshakeRequest`]: `{}` on success.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeResponse {
    /// Set when the hub rejects the handshake.
    #[serde(default)]
    pub error: Option<String>,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Method call. With an id the sender expects a completion; without
    /// one it is a fire-and-forget push.
    Invocation {
        /// Correlation id for the completion.
        invocation_id: Option<String>,
        /// Hub method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Result of an earlier invocation.
    Completion {
        /// Id of the invocation this completes.
        invocation_id: String,
        /// Return value, if any.
        result: Option<Value>,
        /// Failure text; set means the invocation failed.
        error: Option<String>,
    },
    /// Keep-alive.
    Ping,
    /// The hub is closing the connection.
    Close {
        /// Reason given by the hub.
        error: Option<String>,
        /// Whether the client may reconnect.
        allow_reconnect: bool,
    },
    /// A message type this client does not handle (streaming, cancel).
    Other(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: Option<bool>,
}

impl TryFrom<RawMessage> for HubMessage {
    type Error = SyncError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match raw.kind {
            TYPE_INVOCATION => {
                let target = raw
                    .target
                    .ok_or_else(|| SyncError::Protocol("invocation without target".into()))?;
                Ok(Self::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments,
                })
            }
            TYPE_COMPLETION => {
                let invocation_id = raw
                    .invocation_id
                    .ok_or_else(|| SyncError::Protocol("completion without id".into()))?;
                Ok(Self::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            TYPE_PING => Ok(Self::Ping),
            TYPE_CLOSE => Ok(Self::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(Self::Other(other)),
        }
    }
}

impl HubMessage {
    /// Builds an invocation that expects a completion.
    #[must_use]
    pub fn invocation(invocation_id: impl Into<String>, target: &str, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.to_string(),
            arguments,
        }
    }

    /// Encodes this message as one terminated frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Protocol`] for [`HubMessage::Other`], which
    /// this client never sends.
    pub fn to_frame(&self) -> Result<String, SyncError> {
        let value = match self {
            Self::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut value = json!({
                    "type": TYPE_INVOCATION,
                    "target": target,
                    "arguments": arguments,
                });
                if let (Some(id), Some(object)) = (invocation_id, value.as_object_mut()) {
                    object.insert("invocationId".into(), Value::String(id.clone()));
                }
                value
            }
            Self::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut value = json!({"type": TYPE_COMPLETION, "invocationId": invocation_id});
                if let Some(object) = value.as_object_mut() {
                    if let Some(error) = error {
                        object.insert("error".into(), Value::String(error.clone()));
                    } else if let Some(result) = result {
                        object.insert("result".into(), result.clone());
                    }
                }
                value
            }
            Self::Ping => json!({"type": TYPE_PING}),
            Self::Close {
                error,
                allow_reconnect,
            } => json!({
                "type": TYPE_CLOSE,
                "error": error,
                "allowReconnect": allow_reconnect,
            }),
            Self::Other(kind) => {
                return Err(SyncError::Protocol(format!(
                    "cannot encode message type {kind}"
                )));
            }
        };
        Ok(terminate(&serde_json::to_string(&value)?))
    }
}

/// Appends the record separator.
#[must_use]
pub fn terminate(json: &str) -> String {
    let mut frame = String::with_capacity(json.len() + 1);
    frame.push_str(json);
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Encodes the handshake request frame.
///
/// # Errors
///
/// Returns [`SyncError::Protocol`] if serialization fails.
pub fn handshake_frame() -> Result<String, SyncError> {
    Ok(terminate(&serde_json::to_string(&HandshakeRequest::default())?))
}

/// Splits a text frame into its terminated messages, skipping empties.
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|part| !part.trim().is_empty())
}

/// Decodes one message (without its terminator).
///
/// # Errors
///
/// Returns [`SyncError::Protocol`] if the JSON is malformed or a
/// required field is missing.
pub fn decode(message: &str) -> Result<HubMessage, SyncError> {
    let raw: RawMessage = serde_json::from_str(message)?;
    HubMessage::try_from(raw)
}

/// Checks the handshake response carried by the first message of the
/// first frame.
///
/// # Errors
///
/// Returns [`SyncError::Handshake`] if the response is malformed or
/// carries an error.
pub fn check_handshake(message: &str) -> Result<(), SyncError> {
    let response: HandshakeResponse = serde_json::from_str(message)
        .map_err(|e| SyncError::Handshake(format!("malformed response: {e}")))?;
    match response.error {
        Some(error) => Err(SyncError::Handshake(error)),
        None => Ok(()),
    }
}
