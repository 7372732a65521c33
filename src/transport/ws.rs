//! WebSocket implementation of [`HubTransport`].
//!
//! One [`WsHubTransport`] is one session. `start()` dials the hub and
//! completes the handshake; a background task then runs the read/write
//! loop, forwards server pushes as [`TransportEvent`]s, resolves pending
//! invocations, and on a drop walks the [`ReconnectPolicy`] before either
//! reporting `Reconnected` or giving up with `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{self, HubMessage};
use super::{EventSender, HubTransport, TokenFactory, TransportEvent, TransportFactory};
use crate::config::SyncConfig;
use crate::domain::ConnectionState;
use crate::error::SyncError;
use crate::lock;
use crate::sync::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Completion = oneshot::Sender<Result<Value, SyncError>>;

/// How long `stop()` waits for the loop to send its close frame.
const STOP_GRACE: Duration = Duration::from_secs(1);
/// Lower bound for timer periods read from configuration.
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Connection settings shared by every session a factory creates.
#[derive(Debug, Clone)]
pub struct WsTransportOptions {
    /// Hub endpoint; `http(s)` schemes are mapped to `ws(s)`.
    pub hub_url: String,
    /// Sent as the `deviceId` query parameter.
    pub device_id: String,
    /// Evaluated on every dial.
    pub token: TokenFactory,
    /// Backoff schedule for automatic reconnects.
    pub reconnect: ReconnectPolicy,
    /// Interval between client pings.
    pub keepalive_interval: Duration,
    /// Inbound silence that counts as a drop; also bounds the handshake.
    pub server_timeout: Duration,
}

impl WsTransportOptions {
    /// Builds options from the client configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig, token: TokenFactory) -> Self {
        Self {
            hub_url: config.hub_url.clone(),
            device_id: config.device_id.clone(),
            token,
            reconnect: config.reconnect.clone(),
            keepalive_interval: config.keepalive_interval,
            server_timeout: config.server_timeout,
        }
    }

    /// Builds the dial URL for one attempt, evaluating the token factory.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the hub URL does not parse
    /// or uses a scheme other than `ws`, `wss`, `http`, `https`.
    pub fn dial_url(&self) -> Result<url::Url, SyncError> {
        let mut url = url::Url::parse(&self.hub_url)
            .map_err(|e| SyncError::InvalidConfig(format!("hub url: {e}")))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(SyncError::InvalidConfig(format!(
                    "unsupported hub url scheme {other:?}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| SyncError::InvalidConfig(format!("cannot use scheme {scheme}")))?;

        let token = self.token.token();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("deviceId", &self.device_id);
            if !token.is_empty() {
                query.append_pair("access_token", &token);
            }
        }
        Ok(url)
    }
}

/// Creates a [`WsHubTransport`] per session.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    options: WsTransportOptions,
}

impl WsTransportFactory {
    /// Creates a factory with the given options.
    #[must_use]
    pub const fn new(options: WsTransportOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport> {
        Arc::new(WsHubTransport::new(self.options.clone(), events))
    }
}

/// Hub connection over a WebSocket.
#[derive(Debug)]
pub struct WsHubTransport {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    options: WsTransportOptions,
    events: EventSender,
    state: Mutex<ConnectionState>,
    connection_id: Mutex<Option<String>>,
    link: Mutex<Link>,
    next_invocation: AtomicU64,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Write side of the live socket and the invocations waiting on it.
///
/// Kept under one lock: an invocation is registered only while a socket is
/// live, and severing the socket fails everything registered before it.
#[derive(Debug, Default)]
struct Link {
    /// `None` while not connected.
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// In-flight invocations by id, with their method name.
    pending: HashMap<String, (String, Completion)>,
}

/// Why the read/write loop ended.
#[derive(Debug)]
enum DropReason {
    /// Socket error, EOF or server silence.
    Lost(String),
    /// The hub sent a close message.
    Closed {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// `stop()` was called.
    Stopped,
}

impl DropReason {
    fn error(&self) -> Option<String> {
        match self {
            Self::Lost(error) => Some(error.clone()),
            Self::Closed { error, .. } => error.clone(),
            Self::Stopped => None,
        }
    }
}

/// A freshly dialed, handshaken socket.
struct Opened {
    socket: WsStream,
    backlog: Vec<HubMessage>,
    connection_id: String,
}

impl WsHubTransport {
    /// Creates an unstarted transport reporting through `events`.
    #[must_use]
    pub fn new(options: WsTransportOptions, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                events,
                state: Mutex::new(ConnectionState::Disconnected),
                connection_id: Mutex::new(None),
                link: Mutex::new(Link::default()),
                next_invocation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl HubTransport for WsHubTransport {
    async fn start(&self) -> Result<(), SyncError> {
        if self.shared.is_stopped() {
            return Err(SyncError::Stopped);
        }
        self.shared.set_state(ConnectionState::Connecting);

        let opened = match open(&self.shared.options).await {
            Ok(opened) => opened,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if self.shared.is_stopped() {
            let mut socket = opened.socket;
            let _ = socket.close(None).await;
            return Err(SyncError::Stopped);
        }

        let rx = self.shared.go_live(opened.connection_id);
        let handle = tokio::spawn(run(
            Arc::clone(&self.shared),
            opened.socket,
            rx,
            opened.backlog,
        ));
        *lock(&self.shared.task) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.shared.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender makes the loop send a close frame and exit.
        self.shared.sever(None);

        let handle = lock(&self.shared.task).take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err()
        {
            handle.abort();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        *lock(&self.shared.connection_id) = None;
        Ok(())
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SyncError> {
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }

        let id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let frame = HubMessage::invocation(id.as_str(), method, arguments).to_frame()?;
        let (done_tx, done_rx) = oneshot::channel();
        let tx = self.shared.register(&id, method, done_tx)?;

        if tx.send(Message::text(frame)).is_err() {
            lock(&self.shared.link).pending.remove(&id);
            return Err(SyncError::NotConnected);
        }
        drop(tx);

        done_rx.await.unwrap_or(Err(SyncError::Closed(None)))
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    fn connection_id(&self) -> Option<String> {
        lock(&self.shared.connection_id).clone()
    }
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("transport event receiver dropped");
        }
    }

    /// Installs a fresh write channel and marks the session connected.
    fn go_live(&self, connection_id: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.link).outgoing = Some(tx);
        *lock(&self.connection_id) = Some(connection_id);
        self.set_state(ConnectionState::Connected);
        rx
    }

    /// Registers an invocation against the live socket and returns its
    /// write side.
    fn register(
        &self,
        invocation_id: &str,
        method: &str,
        done: Completion,
    ) -> Result<mpsc::UnboundedSender<Message>, SyncError> {
        let mut link = lock(&self.link);
        let Some(tx) = link.outgoing.clone() else {
            return Err(SyncError::NotConnected);
        };
        link.pending
            .insert(invocation_id.to_string(), (method.to_string(), done));
        Ok(tx)
    }

    /// Detaches the socket's write side and fails every pending
    /// invocation with `Closed(error)`.
    fn sever(&self, error: Option<String>) {
        let pending: Vec<_> = {
            let mut link = lock(&self.link);
            link.outgoing = None;
            link.pending.drain().collect()
        };
        for (_, (_, done)) in pending {
            let _ = done.send(Err(SyncError::Closed(error.clone())));
        }
    }

    fn complete(&self, invocation_id: &str, result: Option<Value>, error: Option<String>) {
        let Some((method, done)) = lock(&self.link).pending.remove(invocation_id) else {
            tracing::debug!(invocation_id, "completion for unknown invocation");
            return;
        };
        let outcome = match error {
            Some(message) => Err(SyncError::Rpc { method, message }),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = done.send(outcome);
    }

    /// Handles one inbound message; returns a reason if it ends the
    /// connection.
    fn handle(&self, message: HubMessage) -> Option<DropReason> {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                self.emit(TransportEvent::Invocation { target, arguments });
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                self.complete(&invocation_id, result, error);
                None
            }
            HubMessage::Ping | HubMessage::Other(_) => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => Some(DropReason::Closed {
                error,
                allow_reconnect,
            }),
        }
    }

    /// Gives up: the session is over until the owner starts a new one.
    fn finish(&self, error: Option<String>) {
        self.set_state(ConnectionState::Disconnected);
        *lock(&self.connection_id) = None;
        tracing::warn!(error = ?error, "hub connection closed");
        self.emit(TransportEvent::Closed { error });
    }
}

/// Dials the hub and completes the handshake.
async fn open(options: &WsTransportOptions) -> Result<Opened, SyncError> {
    let url = options.dial_url()?;
    let (mut socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    socket.send(Message::text(protocol::handshake_frame()?)).await?;

    let backlog = tokio::time::timeout(options.server_timeout, read_handshake(&mut socket))
        .await
        .map_err(|_| SyncError::Handshake("timed out waiting for handshake response".into()))??;

    let connection_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(%connection_id, "hub handshake complete");
    Ok(Opened {
        socket,
        backlog,
        connection_id,
    })
}

/// Reads until the handshake response; messages batched after it in the
/// same frame are returned for the loop to process.
async fn read_handshake(socket: &mut WsStream) -> Result<Vec<HubMessage>, SyncError> {
    while let Some(frame) = socket.next().await {
        match frame? {
            Message::Text(text) => {
                let mut parts = protocol::split_frames(text.as_str());
                let Some(first) = parts.next() else {
                    continue;
                };
                protocol::check_handshake(first)?;
                return Ok(parts.filter_map(|part| protocol::decode(part).ok()).collect());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(SyncError::Handshake("connection closed during handshake".into()))
}

/// Session task: pumps the live socket, then reconnects until stopped,
/// refused, or out of attempts.
async fn run(
    shared: Arc<Shared>,
    mut socket: WsStream,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut backlog: Vec<HubMessage>,
) {
    loop {
        let reason = pump(&shared, socket, &mut rx, backlog).await;
        shared.sever(reason.error());

        if shared.is_stopped() || matches!(reason, DropReason::Stopped) {
            shared.set_state(ConnectionState::Disconnected);
            return;
        }
        let error = reason.error();
        let refused = matches!(
            reason,
            DropReason::Closed {
                allow_reconnect: false,
                ..
            }
        );
        if refused || shared.options.reconnect.delays().is_empty() {
            shared.finish(error);
            return;
        }

        tracing::warn!(error = ?error, "hub connection lost, reconnecting");
        shared.set_state(ConnectionState::Reconnecting);
        *lock(&shared.connection_id) = None;
        shared.emit(TransportEvent::Reconnecting { error });

        match reconnect(&shared).await {
            Ok(opened) => {
                rx = shared.go_live(opened.connection_id.clone());
                tracing::info!(connection_id = %opened.connection_id, "hub reconnected");
                shared.emit(TransportEvent::Reconnected {
                    connection_id: Some(opened.connection_id),
                });
                socket = opened.socket;
                backlog = opened.backlog;
            }
            Err(last_error) => {
                if shared.is_stopped() {
                    shared.set_state(ConnectionState::Disconnected);
                } else {
                    shared.finish(last_error);
                }
                return;
            }
        }
    }
}

/// Walks the backoff schedule. On exhaustion returns the last error.
async fn reconnect(shared: &Shared) -> Result<Opened, Option<String>> {
    let mut last_error = None;
    let mut attempt = 0;
    while let Some(delay) = shared.options.reconnect.delay_for(attempt) {
        tokio::time::sleep(delay).await;
        if shared.is_stopped() {
            return Err(None);
        }
        match open(&shared.options).await {
            Ok(opened) if shared.is_stopped() => {
                let mut socket = opened.socket;
                let _ = socket.close(None).await;
                return Err(None);
            }
            Ok(opened) => return Ok(opened),
            Err(e) => {
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "reconnect attempt failed");
                last_error = Some(e.to_string());
            }
        }
        attempt += 1;
    }
    Err(last_error)
}

/// Read/write loop over one socket.
async fn pump(
    shared: &Shared,
    socket: WsStream,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    backlog: Vec<HubMessage>,
) -> DropReason {
    let (mut ws_tx, mut ws_rx) = socket.split();

    for message in backlog {
        if let Some(reason) = shared.handle(message) {
            return reason;
        }
    }

    let period = shared.options.keepalive_interval.max(MIN_PERIOD);
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    let silence = shared.options.server_timeout.max(MIN_PERIOD);
    let idle = tokio::time::sleep(silence);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Outgoing invocation from `invoke()`
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if let Err(e) = ws_tx.send(message).await {
                            return DropReason::Lost(e.to_string());
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return DropReason::Stopped;
                    }
                }
            }
            // Incoming frame from the hub
            inbound = ws_rx.next() => {
                idle.as_mut().reset(Instant::now() + silence);
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        for part in protocol::split_frames(text.as_str()) {
                            match protocol::decode(part) {
                                Ok(message) => {
                                    if let Some(reason) = shared.handle(message) {
                                        return reason;
                                    }
                                }
                                Err(e) => tracing::debug!(error = %e, "dropping malformed hub message"),
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "socket closed by hub".to_string());
                        return DropReason::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return DropReason::Lost(e.to_string()),
                    None => return DropReason::Lost("socket closed".to_string()),
                }
            }
            _ = keepalive.tick() => {
                let ping = match HubMessage::Ping.to_frame() {
                    Ok(ping) => ping,
                    Err(e) => return DropReason::Lost(e.to_string()),
                };
                if let Err(e) = ws_tx.send(Message::text(ping)).await {
                    return DropReason::Lost(e.to_string());
                }
            }
            () = &mut idle => {
                return DropReason::Lost("server timeout".to_string());
            }
        }
    }
}
