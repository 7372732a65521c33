//! Client configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). The access token is deliberately not
//! part of this struct; it is read through a
//! [`TokenFactory`](crate::transport::TokenFactory) on every connection
//! attempt.

use std::time::Duration;

use crate::domain::RoomId;
use crate::error::SyncError;
use crate::sync::ReconnectPolicy;

/// Default backoff schedule in milliseconds.
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 4] = [0, 2_000, 10_000, 30_000];

/// Top-level client configuration.
///
/// Loaded once at startup via [`SyncConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Hub endpoint, e.g. `ws://localhost:5000/chatHub`.
    pub hub_url: String,

    /// Device identifier sent as the `deviceId` query parameter.
    pub device_id: String,

    /// Id of the signed-in user; selects the user's entry in per-room
    /// unread maps.
    pub user_id: String,

    /// Initial desired room set.
    pub room_ids: Vec<RoomId>,

    /// Delays the transport waits before each reconnect attempt.
    pub reconnect: ReconnectPolicy,

    /// Interval between client keep-alive pings.
    pub keepalive_interval: Duration,

    /// Silence from the hub longer than this is treated as a drop.
    pub server_timeout: Duration,

    /// Interval between active-room presence pings.
    pub presence_interval: Duration,

    /// Capacity of the connection state broadcast bus.
    pub state_bus_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://localhost:5000/chatHub".to_string(),
            device_id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            room_ids: Vec::new(),
            reconnect: ReconnectPolicy::from_millis(&DEFAULT_RECONNECT_DELAYS_MS),
            keepalive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            presence_interval: Duration::from_secs(20),
            state_bus_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to [`SyncConfig::default`] values when a variable is not
    /// set. Calls `dotenvy::dotenv().ok()` to optionally load a `.env`
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if `HUB_URL` is not a valid
    /// URL or `RECONNECT_DELAYS_MS` is not a comma-separated list of
    /// integers.
    pub fn from_env() -> Result<Self, SyncError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let hub_url = std::env::var("HUB_URL").unwrap_or(defaults.hub_url);
        url::Url::parse(&hub_url)
            .map_err(|e| SyncError::InvalidConfig(format!("HUB_URL {hub_url:?}: {e}")))?;

        let device_id = std::env::var("DEVICE_ID").unwrap_or(defaults.device_id);
        let user_id = std::env::var("USER_ID").unwrap_or(defaults.user_id);
        let room_ids = std::env::var("ROOM_IDS")
            .map(|v| parse_room_list(&v))
            .unwrap_or_default();

        let reconnect = if parse_env_bool("RECONNECT_ENABLED", true) {
            match std::env::var("RECONNECT_DELAYS_MS") {
                Ok(raw) => ReconnectPolicy::from_millis(&parse_delays(&raw)?),
                Err(_) => defaults.reconnect,
            }
        } else {
            ReconnectPolicy::disabled()
        };

        let keepalive_interval = Duration::from_secs(parse_env("KEEPALIVE_INTERVAL_SECS", 15));
        let server_timeout = Duration::from_secs(parse_env("SERVER_TIMEOUT_SECS", 30));
        let presence_interval = Duration::from_secs(parse_env("PRESENCE_INTERVAL_SECS", 20));
        let state_bus_capacity = parse_env("STATE_BUS_CAPACITY", defaults.state_bus_capacity);

        Ok(Self {
            hub_url,
            device_id,
            user_id,
            room_ids,
            reconnect,
            keepalive_interval,
            server_timeout,
            presence_interval,
            state_bus_capacity,
        })
    }
}

/// Splits a comma-separated room list, trimming blanks and duplicates
/// while keeping first-seen order.
#[must_use]
pub fn parse_room_list(raw: &str) -> Vec<RoomId> {
    let mut rooms: Vec<RoomId> = Vec::new();
    for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let id = RoomId::new(code);
        if !rooms.contains(&id) {
            rooms.push(id);
        }
    }
    rooms
}

/// Parses a comma-separated list of millisecond delays.
///
/// # Errors
///
/// Returns [`SyncError::InvalidConfig`] on the first entry that is not an
/// unsigned integer.
pub fn parse_delays(raw: &str) -> Result<Vec<u64>, SyncError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|e| SyncError::InvalidConfig(format!("RECONNECT_DELAYS_MS entry {s:?}: {e}")))
        })
        .collect()
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}
