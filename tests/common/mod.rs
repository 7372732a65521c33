//! Shared fixtures: a scripted in-memory hub transport and a recording
//! store.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use room_sync::domain::{ChatMessage, ConnectionState, NotificationCounts, RoomId};
use room_sync::error::SyncError;
use room_sync::store::ChatStore;
use room_sync::transport::{EventSender, HubTransport, TransportEvent, TransportFactory};

/// Controls every transport a [`MockFactory`] creates.
#[derive(Debug, Default)]
pub struct MockHub {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    failing: Mutex<HashSet<(String, String)>>,
    held: Mutex<Option<(String, String, Arc<Notify>)>>,
    current: Mutex<Option<Arc<MockTransport>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn TransportFactory> {
        Arc::new(MockFactory {
            hub: Arc::clone(self),
        })
    }

    /// Makes every later `start()` wait until the returned handle is
    /// notified.
    pub fn gate_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Makes `method` fail for `room` until [`MockHub::heal`].
    pub fn fail(&self, method: &str, room: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((method.to_string(), room.to_string()));
    }

    /// Makes the next call of `method` for `room` wait, after it has been
    /// recorded, until the returned handle is notified. Applies once.
    pub fn hold(&self, method: &str, room: &str) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.held.lock().unwrap() =
            Some((method.to_string(), room.to_string(), Arc::clone(&release)));
        release
    }

    pub fn heal(&self, method: &str, room: &str) {
        self.failing
            .lock()
            .unwrap()
            .remove(&(method.to_string(), room.to_string()));
    }

    /// First arguments of every recorded call to `method`, in order.
    pub fn calls(&self, method: &str) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.first().map(first_arg).unwrap_or_default())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.invocations.lock().unwrap().clear();
    }

    /// Sends a server push to the manager.
    pub fn push(&self, target: &str, payload: Value) {
        self.emit(TransportEvent::Invocation {
            target: target.to_string(),
            arguments: vec![payload],
        });
    }

    /// Simulates a drop picked up by automatic retry.
    pub fn drop_connection(&self) {
        self.set_transport_state(ConnectionState::Reconnecting);
        self.emit(TransportEvent::Reconnecting {
            error: Some("connection reset".to_string()),
        });
    }

    /// Simulates a successful automatic retry.
    pub fn restore_connection(&self) {
        self.set_transport_state(ConnectionState::Connected);
        self.emit(TransportEvent::Reconnected {
            connection_id: Some("mock-reconnected".to_string()),
        });
    }

    /// Simulates the transport giving up.
    pub fn close(&self, error: &str) {
        self.set_transport_state(ConnectionState::Disconnected);
        self.emit(TransportEvent::Closed {
            error: Some(error.to_string()),
        });
    }

    fn emit(&self, event: TransportEvent) {
        let current = self.current.lock().unwrap().clone();
        let transport = current.expect("no transport created yet");
        transport.events.send(event).expect("manager dropped events");
    }

    fn set_transport_state(&self, state: ConnectionState) {
        if let Some(transport) = self.current.lock().unwrap().as_ref() {
            *transport.state.lock().unwrap() = state;
        }
    }
}

fn first_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct MockFactory {
    hub: Arc<MockHub>,
}

impl TransportFactory for MockFactory {
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport> {
        let transport = Arc::new(MockTransport {
            hub: Arc::clone(&self.hub),
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            generation: self.hub.starts(),
        });
        *self.hub.current.lock().unwrap() = Some(Arc::clone(&transport));
        transport
    }
}

#[derive(Debug)]
struct MockTransport {
    hub: Arc<MockHub>,
    events: EventSender,
    state: Mutex<ConnectionState>,
    generation: usize,
}

#[async_trait]
impl HubTransport for MockTransport {
    async fn start(&self) -> Result<(), SyncError> {
        self.hub.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnectionState::Connecting;
        let gate = self.hub.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.hub.fail_start.load(Ordering::SeqCst) {
            *self.state.lock().unwrap() = ConnectionState::Disconnected;
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Disconnected {
            return Err(SyncError::Stopped);
        }
        *state = ConnectionState::Connected;
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.hub.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        Ok(())
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SyncError> {
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        let room = arguments.first().map(first_arg).unwrap_or_default();
        self.hub
            .invocations
            .lock()
            .unwrap()
            .push((method.to_string(), arguments));
        let held = {
            let mut held = self.hub.held.lock().unwrap();
            match held.as_ref() {
                Some((m, r, _)) if m == method && *r == room => held.take(),
                _ => None,
            }
        };
        if let Some((_, _, release)) = held {
            release.notified().await;
        }
        tokio::task::yield_now().await;
        if self
            .hub
            .failing
            .lock()
            .unwrap()
            .contains(&(method.to_string(), room))
        {
            return Err(SyncError::Rpc {
                method: method.to_string(),
                message: "rejected by hub".to_string(),
            });
        }
        Ok(Value::Null)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn connection_id(&self) -> Option<String> {
        (self.state() == ConnectionState::Connected).then(|| format!("mock-{}", self.generation))
    }
}

/// Store that records each setter call as a short string.
#[derive(Debug, Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ChatStore for RecordingStore {
    fn update_last_message(&self, room_id: &RoomId, _message: &ChatMessage) {
        self.record(format!("last:{room_id}"));
    }

    fn update_chat_room_from_message(&self, message: &ChatMessage) {
        let room = message.room_id().map(|r| r.to_string()).unwrap_or_default();
        self.record(format!("room:{room}"));
    }

    fn set_room_unread(&self, room_id: &RoomId, count: u64) {
        self.record(format!("unread:{room_id}:{count}"));
    }

    fn set_notification_counts(&self, counts: NotificationCounts) {
        self.record(format!(
            "counts:{}:{}",
            counts.unread_rooms_count, counts.pending_friend_requests_count
        ));
    }

    fn refetch_chat_rooms(&self) {
        self.record("refetch".to_string());
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Rooms from string codes.
pub fn rooms(codes: &[&str]) -> Vec<RoomId> {
    codes.iter().map(|c| RoomId::new(*c)).collect()
}
