//! Connection manager: session lifecycle, subscription replay and event
//! application.
//!
//! A session is one transport instance from `connect()` until `stop()` or
//! a final close. Every session gets a numeric id; callbacks and late
//! transport results carry the id they were issued under and are ignored
//! once it no longer matches the current session.
//!
//! Inside a session, room membership is tracked per connection epoch (see
//! [`SubscriptionTracker`]). A transport-level reconnect keeps the session
//! but starts a new epoch, so RPC replies from the lost connection are
//! never recorded against the new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{EnvironmentTrigger, EventDispatcher, PresenceTask, SubscriptionTracker};
use crate::config::SyncConfig;
use crate::domain::{ConnectionState, HubEvent, RoomId, StateBus, StateChange};
use crate::lock;
use crate::store::ChatStore;
use crate::transport::{
    HubTransport, JOIN_ROOM, JOIN_USER_NOTIFY, LEAVE_ROOM, PING_ACTIVE_ROOM,
    SET_INACTIVE_IN_ROOM, TransportEvent, TransportFactory,
};

type Latch = Shared<BoxFuture<'static, ()>>;

/// Owns the hub connection for one client.
///
/// Cheap to clone; all clones share one session. No public method returns
/// an error: failures are logged and the manager stays in its current
/// state until the next diff cycle, reconnect or external trigger.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    store: Arc<dyn ChatStore>,
    bus: StateBus,
    presence_interval: Duration,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    tracker: Mutex<SubscriptionTracker>,
    dispatcher: Mutex<EventDispatcher>,
    /// Held for the whole of a diff cycle so cycles never overlap.
    sync_lock: tokio::sync::Mutex<()>,
    presence: Mutex<Option<PresenceTask>>,
}

struct Session {
    id: u64,
    transport: Arc<dyn HubTransport>,
    /// Resolves when the first `start()` of this session has settled.
    latch: Latch,
    events: JoinHandle<()>,
}

impl ConnectionManager {
    /// Creates a manager. Nothing connects until [`connect`](Self::connect).
    ///
    /// `config.room_ids` seeds the desired room set.
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        let mut tracker = SubscriptionTracker::new();
        tracker.set_desired(config.room_ids.iter().cloned());
        Self {
            inner: Arc::new(Inner {
                factory,
                store,
                bus: StateBus::new(config.state_bus_capacity),
                presence_interval: config.presence_interval,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
                tracker: Mutex::new(tracker),
                dispatcher: Mutex::new(EventDispatcher::new(config.user_id.clone())),
                sync_lock: tokio::sync::Mutex::new(()),
                presence: Mutex::new(None),
            }),
        }
    }

    /// Connects, or joins the attempt already in flight.
    ///
    /// While a session is `Connecting`, `Connected` or `Reconnecting`
    /// this awaits that session's first start instead of creating a
    /// second transport. A fresh session performs the user-notify
    /// handshake and replays the whole desired set once started.
    ///
    /// Returns the state after the attempt settles.
    pub async fn connect(&self) -> ConnectionState {
        let latch = {
            let mut session = lock(&self.inner.session);
            let in_flight = session
                .as_ref()
                .filter(|_| self.inner.state().is_active())
                .map(|current| current.latch.clone());
            match in_flight {
                Some(latch) => latch,
                None => {
                    let fresh = Inner::open_session(&self.inner);
                    let latch = fresh.latch.clone();
                    if let Some(old) = session.replace(fresh) {
                        retire(old);
                    }
                    latch
                }
            }
        };
        latch.await;
        self.state()
    }

    /// Alias of [`connect`](Self::connect).
    pub async fn start_connection(&self) -> ConnectionState {
        self.connect().await
    }

    /// Tears the session down. Safe at any point, including mid-connect:
    /// an attempt still in flight resolves into a stale session and is
    /// discarded.
    ///
    /// Clears the joined set, the handshake flag and the dedup caches and
    /// cancels presence pings. The desired set is kept, so a later
    /// `connect()` replays it from scratch. Replies to RPCs still in
    /// flight are discarded.
    pub async fn stop(&self) {
        let session = {
            let mut session = lock(&self.inner.session);
            let taken = session.take();
            self.inner.set_state(ConnectionState::Disconnected, None);
            taken
        };
        if let Some(task) = lock(&self.inner.presence).take() {
            task.cancel();
        }
        lock(&self.inner.tracker).clear_session();
        lock(&self.inner.dispatcher).reset();

        if let Some(session) = session {
            tracing::info!(session = session.id, "stopping hub connection");
            session.events.abort();
            if let Err(e) = session.transport.stop().await {
                tracing::warn!(error = %e, code = e.error_code(), "transport stop failed");
            }
        }
    }

    /// Alias of [`stop`](Self::stop).
    pub async fn stop_connection(&self) {
        self.stop().await;
    }

    /// Replaces the desired room set.
    ///
    /// Without a live connection this only records the set; the next
    /// successful connect replays it. When connected, the join / leave
    /// diff is applied immediately, one RPC at a time, after any cycle
    /// already running. An unchanged set issues no RPCs.
    pub async fn set_desired_rooms(&self, rooms: impl IntoIterator<Item = RoomId>) {
        let changed = lock(&self.inner.tracker).set_desired(rooms);
        if !changed {
            tracing::debug!("desired rooms unchanged");
            return;
        }
        if self.state() != ConnectionState::Connected {
            tracing::debug!(state = self.state().as_str(), "room sync deferred until connected");
            return;
        }
        let Some((session_id, transport)) = self.inner.current() else {
            return;
        };
        let _cycle = self.inner.sync_lock.lock().await;
        self.inner.run_cycle(session_id, transport.as_ref()).await;
    }

    /// Reacts to a network-online or app-foreground signal.
    ///
    /// Connects only if the manager is `Disconnected`; otherwise the
    /// transport's own retry is already running. Returns whether a
    /// connect was issued.
    pub async fn handle_trigger(&self, trigger: EnvironmentTrigger) -> bool {
        let state = self.state();
        if !trigger.should_reconnect(state) {
            tracing::debug!(trigger = trigger.as_str(), state = state.as_str(), "trigger ignored");
            return false;
        }
        tracing::info!(trigger = trigger.as_str(), "resuming hub connection");
        self.connect().await;
        true
    }

    /// Starts presence pings for `room`, or stops them with `None`.
    ///
    /// Switching rooms cancels the previous loop and, while connected,
    /// tells the hub the user is no longer active in the previous room
    /// (`SetInactiveInRoom`). Selecting the room that is already active
    /// keeps it running and sends nothing.
    pub async fn set_active_room(&self, room: Option<RoomId>) {
        let previous = {
            let mut presence = lock(&self.inner.presence);
            if presence.as_ref().map(PresenceTask::room) == room.as_ref() {
                return;
            }
            let previous = presence.take().map(PresenceTask::cancel);
            if let Some(room) = room {
                let weak = Arc::downgrade(&self.inner);
                *presence = Some(PresenceTask::spawn(
                    room,
                    self.inner.presence_interval,
                    move |room| ping_active_room(Weak::clone(&weak), room),
                ));
            }
            previous
        };
        if let Some(previous) = previous {
            self.inner.set_inactive(previous).await;
        }
    }

    /// Returns the room presence pings are sent for.
    #[must_use]
    pub fn active_room(&self) -> Option<RoomId> {
        lock(&self.inner.presence)
            .as_ref()
            .map(|task| task.room().clone())
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns `true` if RPCs can be issued.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Rooms the hub confirmed on the current connection.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        lock(&self.inner.tracker).joined()
    }

    /// The desired set as of the last reconciliation with the hub.
    #[must_use]
    pub fn active_rooms(&self) -> Vec<RoomId> {
        lock(&self.inner.tracker).active().to_vec()
    }

    /// The current desired set.
    #[must_use]
    pub fn desired_rooms(&self) -> Vec<RoomId> {
        lock(&self.inner.tracker).desired().to_vec()
    }

    /// Id of the live underlying connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        self.inner.current().and_then(|(_, t)| t.connection_id())
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.bus.subscribe()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("joined", &self.joined_rooms())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Sets the state and publishes it if anything changed.
    fn set_state(&self, state: ConnectionState, connection_id: Option<String>) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!(state = state.as_str(), connection_id = ?connection_id, "connection state");
        let observers = self.bus.publish(state, connection_id);
        tracing::trace!(observers, "state change published");
    }

    fn is_current(&self, session_id: u64) -> bool {
        lock(&self.session).as_ref().is_some_and(|s| s.id == session_id)
    }

    fn current(&self) -> Option<(u64, Arc<dyn HubTransport>)> {
        lock(&self.session)
            .as_ref()
            .map(|s| (s.id, Arc::clone(&s.transport)))
    }

    /// Applies a transition only if `session_id` is still current.
    fn transition(
        &self,
        session_id: u64,
        state: ConnectionState,
        connection_id: Option<String>,
    ) -> bool {
        let session = lock(&self.session);
        if !session.as_ref().is_some_and(|s| s.id == session_id) {
            return false;
        }
        self.set_state(state, connection_id);
        true
    }

    /// Drops the session if it is still current and settles in
    /// `Disconnected`.
    fn end_session(&self, session_id: u64) {
        let ended = {
            let mut session = lock(&self.session);
            if !session.as_ref().is_some_and(|s| s.id == session_id) {
                return;
            }
            self.set_state(ConnectionState::Disconnected, None);
            session.take()
        };
        lock(&self.tracker).reset_joined();
        if let Some(ended) = ended {
            retire(ended);
        }
    }

    /// Builds a session and starts its attempt. Called with the session
    /// lock held; sets `Connecting` before returning so concurrent callers
    /// see an active state.
    fn open_session(this: &Arc<Self>) -> Session {
        let id = this.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = this.factory.create(tx);
        let events = tokio::spawn(event_loop(Arc::downgrade(this), id, rx));

        lock(&this.tracker).reset_joined();
        this.set_state(ConnectionState::Connecting, None);
        tracing::info!(session = id, "connecting to hub");

        let latch = establish(Arc::clone(this), id, Arc::clone(&transport))
            .boxed()
            .shared();
        // The attempt runs even if every caller stops waiting.
        tokio::spawn(latch.clone());

        Session {
            id,
            transport,
            latch,
            events,
        }
    }

    /// Runs the user-notify handshake if it has not succeeded yet on this
    /// connection.
    async fn handshake(&self, session_id: u64, transport: &dyn HubTransport) {
        let epoch = {
            let tracker = lock(&self.tracker);
            if tracker.has_user_notify() {
                return;
            }
            tracker.epoch()
        };
        if !self.can_invoke(session_id, epoch, transport) {
            return;
        }
        match transport.invoke(JOIN_USER_NOTIFY, Vec::new()).await {
            Ok(_) if lock(&self.tracker).mark_user_notify(epoch) => {
                tracing::debug!("joined user notifications");
            }
            Ok(_) => tracing::debug!("dropping user notify reply from a lost connection"),
            Err(e) => {
                tracing::warn!(error = %e, code = e.error_code(), "user notify handshake failed");
            }
        }
    }

    /// Handshake plus full replay of the desired set on a fresh
    /// connection. The caller has already started a new epoch, so a cycle
    /// still holding `sync_lock` for the lost connection stops at its next
    /// reply and records nothing.
    async fn resync(&self, session_id: u64, transport: &dyn HubTransport) {
        let _cycle = self.sync_lock.lock().await;
        if !self.is_current(session_id) {
            return;
        }
        self.handshake(session_id, transport).await;
        self.run_cycle(session_id, transport).await;
    }

    /// One diff cycle: leaves first, then joins, one RPC at a time.
    /// Callers hold `sync_lock`.
    ///
    /// The cycle stops as soon as the session or its connection epoch
    /// changes, and replies that arrive after such a change are dropped.
    async fn run_cycle(&self, session_id: u64, transport: &dyn HubTransport) {
        let (epoch, diff) = lock(&self.tracker).begin_cycle();
        if diff.is_empty() {
            tracing::debug!("room subscriptions already in sync");
            return;
        }
        tracing::debug!(
            join = diff.to_join.len(),
            leave = diff.to_leave.len(),
            "syncing room subscriptions"
        );

        for room in diff.to_leave {
            if !self.can_invoke(session_id, epoch, transport) {
                return;
            }
            match transport.invoke(LEAVE_ROOM, vec![room.clone().into()]).await {
                Ok(_) if lock(&self.tracker).mark_left(epoch, &room) => {
                    tracing::debug!(room = %room, "left room");
                }
                Ok(_) => {
                    tracing::debug!(room = %room, "dropping leave reply from a lost connection");
                    return;
                }
                Err(e) => tracing::warn!(room = %room, error = %e, code = e.error_code(), "leave failed"),
            }
        }
        for room in diff.to_join {
            if !self.can_invoke(session_id, epoch, transport) {
                return;
            }
            match transport.invoke(JOIN_ROOM, vec![room.clone().into()]).await {
                Ok(_) if lock(&self.tracker).mark_joined(epoch, room.clone()) => {
                    tracing::debug!(room = %room, "joined room");
                }
                Ok(_) => {
                    tracing::debug!(room = %room, "dropping join reply from a lost connection");
                    return;
                }
                Err(e) => tracing::warn!(room = %room, error = %e, code = e.error_code(), "join failed"),
            }
        }
    }

    fn can_invoke(&self, session_id: u64, epoch: u64, transport: &dyn HubTransport) -> bool {
        self.is_current(session_id)
            && lock(&self.tracker).epoch() == epoch
            && transport.state() == ConnectionState::Connected
    }

    /// Tells the hub the user left `room` in the UI. Skipped while not
    /// connected; failures are logged.
    async fn set_inactive(&self, room: RoomId) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let Some((_, transport)) = self.current() else {
            return;
        };
        match transport.invoke(SET_INACTIVE_IN_ROOM, vec![room.clone().into()]).await {
            Ok(_) => tracing::debug!(room = %room, "marked inactive in room"),
            Err(e) => {
                tracing::warn!(room = %room, error = %e, code = e.error_code(), "set inactive failed");
            }
        }
    }

    /// Applies one transport event. Only called for the current session.
    async fn on_event(&self, session_id: u64, transport: &dyn HubTransport, event: TransportEvent) {
        match event {
            TransportEvent::Invocation { target, arguments } => {
                let Some(event) = HubEvent::parse(&target, &arguments) else {
                    tracing::debug!(%target, "dropping unrecognized hub event");
                    return;
                };
                let updates = lock(&self.dispatcher).dispatch(event);
                for update in &updates {
                    update.apply(self.store.as_ref());
                }
            }
            TransportEvent::Reconnecting { error } => {
                tracing::warn!(error = ?error, "hub connection lost, transport retrying");
                self.transition(session_id, ConnectionState::Reconnecting, None);
            }
            TransportEvent::Reconnected { connection_id } => {
                tracing::info!(connection_id = ?connection_id, "hub reconnected, replaying rooms");
                // New epoch: replies still owed by the lost connection are
                // dropped.
                lock(&self.tracker).reset_joined();
                if self.transition(session_id, ConnectionState::Connected, connection_id) {
                    self.resync(session_id, transport).await;
                }
            }
            TransportEvent::Closed { error } => {
                tracing::warn!(error = ?error, "hub connection closed");
                self.end_session(session_id);
            }
        }
    }
}

/// First start of a session, behind the connect latch.
async fn establish(inner: Arc<Inner>, session_id: u64, transport: Arc<dyn HubTransport>) {
    if !inner.is_current(session_id) {
        return;
    }
    let result = transport.start().await;
    if !inner.is_current(session_id) {
        tracing::debug!(session = session_id, "discarding stale connection attempt");
        let _ = transport.stop().await;
        return;
    }
    match result {
        Ok(()) => {
            let connection_id = transport.connection_id();
            tracing::info!(connection_id = ?connection_id, "connected to hub");
            if inner.transition(session_id, ConnectionState::Connected, connection_id) {
                inner.resync(session_id, transport.as_ref()).await;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, code = e.error_code(), "hub connection failed");
            inner.end_session(session_id);
        }
    }
}

/// Applies a session's transport events in arrival order.
async fn event_loop(
    inner: Weak<Inner>,
    session_id: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let Some((current, transport)) = inner.current() else {
            continue;
        };
        if current != session_id {
            tracing::debug!(session = session_id, "ignoring event from stale session");
            continue;
        }
        inner.on_event(session_id, transport.as_ref(), event).await;
    }
}

/// Stops a session that is no longer current.
fn retire(session: Session) {
    let transport = session.transport;
    tokio::spawn(async move {
        if let Err(e) = transport.stop().await {
            tracing::debug!(error = %e, "retired transport stop failed");
        }
    });
}

async fn ping_active_room(inner: Weak<Inner>, room: RoomId) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.state() != ConnectionState::Connected {
        return;
    }
    let Some((_, transport)) = inner.current() else {
        return;
    };
    if let Err(e) = transport.invoke(PING_ACTIVE_ROOM, vec![room.clone().into()]).await {
        tracing::warn!(room = %room, error = %e, code = e.error_code(), "presence ping failed");
    }
}
