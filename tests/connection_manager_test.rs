//! Connection manager behavior against a scripted hub transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_pending, assert_ready, task};

use common::{MockHub, RecordingStore, rooms, wait_until};
use room_sync::config::SyncConfig;
use room_sync::domain::{ConnectionState, RoomId};
use room_sync::sync::{ConnectionManager, EnvironmentTrigger};
use room_sync::transport::{
    JOIN_ROOM, JOIN_USER_NOTIFY, LEAVE_ROOM, PING_ACTIVE_ROOM, SET_INACTIVE_IN_ROOM,
};

fn config(codes: &[&str]) -> SyncConfig {
    SyncConfig {
        user_id: "5".to_string(),
        room_ids: rooms(codes),
        presence_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn manager(codes: &[&str]) -> (ConnectionManager, Arc<MockHub>, Arc<RecordingStore>) {
    let hub = MockHub::new();
    let store = RecordingStore::new();
    let manager = ConnectionManager::new(&config(codes), hub.factory(), Arc::clone(&store) as _);
    (manager, hub, store)
}

/// Pushes a refetch marker and waits for it, so every event sent before it
/// has been applied.
async fn flush(hub: &MockHub, store: &RecordingStore) {
    let before = store.count("refetch");
    hub.push("RoomChatUpdated", json!({}));
    assert!(wait_until(|| store.count("refetch") > before).await);
}

#[tokio::test]
async fn concurrent_connects_share_one_start() {
    let (manager, hub, _store) = manager(&["r1"]);
    let gate = hub.gate_starts();

    let mut first = task::spawn(manager.connect());
    let mut second = task::spawn(manager.connect());
    let mut third = task::spawn(manager.connect());
    assert_pending!(first.poll());
    assert_pending!(second.poll());
    assert_pending!(third.poll());
    assert_eq!(manager.state(), ConnectionState::Connecting);

    assert!(wait_until(|| hub.starts() == 1).await);
    gate.notify_one();
    assert!(wait_until(|| manager.joined_rooms() == rooms(&["r1"])).await);

    assert_eq!(assert_ready!(first.poll()), ConnectionState::Connected);
    assert_eq!(assert_ready!(second.poll()), ConnectionState::Connected);
    assert_eq!(assert_ready!(third.poll()), ConnectionState::Connected);
    assert_eq!(hub.starts(), 1);
}

#[tokio::test]
async fn connect_while_connected_reuses_session() {
    let (manager, hub, _store) = manager(&["r1"]);
    assert_eq!(manager.connect().await, ConnectionState::Connected);
    let (a, b) = tokio::join!(manager.connect(), manager.connect());
    assert_eq!((a, b), (ConnectionState::Connected, ConnectionState::Connected));
    assert_eq!(hub.starts(), 1);
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1"]);
}

#[tokio::test]
async fn first_connect_handshakes_then_replays_desired_set() {
    let (manager, hub, _store) = manager(&["r1", "r2"]);
    assert_eq!(manager.connect().await, ConnectionState::Connected);

    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r2"]);
    assert_eq!(manager.joined_rooms(), rooms(&["r1", "r2"]));
    assert_eq!(manager.active_rooms(), rooms(&["r1", "r2"]));
    assert!(manager.is_connected());
    assert_eq!(manager.connection_id().as_deref(), Some("mock-0"));
}

#[tokio::test]
async fn duplicate_unread_count_reaches_store_once() {
    let (manager, hub, store) = manager(&["r1", "r2"]);
    manager.connect().await;

    let unread = json!({"chatCode": "r1", "allUnreadCounts": {"5": 5}});
    hub.push("UnreadCountChanged", unread.clone());
    hub.push("UnreadCountChanged", unread);
    flush(&hub, &store).await;

    assert_eq!(store.count("unread:r1:5"), 1);
}

#[tokio::test]
async fn notification_counts_forwarded_on_change_only() {
    let (manager, hub, store) = manager(&[]);
    manager.connect().await;

    let counts = json!({"userId": 5, "unreadRoomsCount": 3, "pendingFriendRequestsCount": 1});
    hub.push("RoomChatAndFriendRequestReceived", counts.clone());
    hub.push("RoomChatAndFriendRequestReceived", counts);
    hub.push(
        "RoomChatAndFriendRequestReceived",
        json!({"userId": 5, "unreadRoomsCount": 4, "pendingFriendRequestsCount": 1}),
    );
    flush(&hub, &store).await;

    assert_eq!(store.count("counts:3:1"), 1);
    assert_eq!(store.count("counts:4:1"), 1);
}

#[tokio::test]
async fn silent_update_skips_last_message() {
    let (manager, hub, store) = manager(&["r1"]);
    manager.connect().await;

    hub.push(
        "UpdateUserMessage",
        json!({"chatInfo": {"code": "r1"}, "isNotifyRoomChat": false}),
    );
    flush(&hub, &store).await;

    assert_eq!(store.count("room:r1"), 1);
    assert_eq!(store.count("last:r1"), 0);
}

#[tokio::test]
async fn received_message_moves_last_message_then_updates_room() {
    let (manager, hub, store) = manager(&["r1"]);
    manager.connect().await;

    hub.push("ReceiveUserMessage", json!({"roomId": "r1", "messageText": "hi"}));
    hub.push("ReceiveUserMessage", json!({"messageText": "no room"}));
    hub.push("SomethingElse", json!({}));
    flush(&hub, &store).await;

    assert_eq!(store.calls(), vec!["last:r1", "room:r1", "refetch"]);
}

#[tokio::test]
async fn reconnect_replays_every_desired_room() {
    let (manager, hub, _store) = manager(&["r1", "r2", "r3"]);
    hub.fail(JOIN_ROOM, "r2");
    manager.connect().await;
    assert_eq!(manager.joined_rooms(), rooms(&["r1", "r3"]));

    hub.heal(JOIN_ROOM, "r2");
    hub.drop_connection();
    assert!(wait_until(|| manager.state() == ConnectionState::Reconnecting).await);
    hub.clear_calls();

    hub.restore_connection();
    assert!(wait_until(|| manager.joined_rooms().len() == 3).await);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r2", "r3"]);
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert!(manager.is_connected());
    assert_eq!(hub.starts(), 1);
}

#[tokio::test]
async fn failed_join_does_not_abort_cycle() {
    let (manager, hub, _store) = manager(&["r1", "r2", "r3"]);
    hub.fail(JOIN_ROOM, "r1");
    assert_eq!(manager.connect().await, ConnectionState::Connected);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r2", "r3"]);
    assert_eq!(manager.joined_rooms(), rooms(&["r2", "r3"]));
}

#[tokio::test]
async fn desired_set_diff_is_applied_sequentially() {
    let (manager, hub, _store) = manager(&["r1", "r2"]);
    manager.connect().await;
    hub.clear_calls();

    manager.set_desired_rooms(rooms(&["r2", "r3"])).await;
    assert_eq!(hub.calls(LEAVE_ROOM), vec!["r1"]);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r3"]);
    assert_eq!(manager.joined_rooms(), rooms(&["r2", "r3"]));
    assert_eq!(manager.active_rooms(), rooms(&["r2", "r3"]));

    hub.clear_calls();
    manager.set_desired_rooms(rooms(&["r2", "r3"])).await;
    assert!(hub.calls(LEAVE_ROOM).is_empty());
    assert!(hub.calls(JOIN_ROOM).is_empty());
}

#[tokio::test]
async fn desired_set_before_connect_is_deferred() {
    let (manager, hub, _store) = manager(&[]);
    manager.set_desired_rooms(rooms(&["a", "b"])).await;
    assert_eq!(hub.starts(), 0);
    assert_eq!(manager.desired_rooms(), rooms(&["a", "b"]));
    assert!(manager.joined_rooms().is_empty());

    manager.connect().await;
    assert_eq!(hub.calls(JOIN_ROOM), vec!["a", "b"]);
}

#[tokio::test]
async fn stop_tears_down_and_next_connect_starts_over() {
    let (manager, hub, store) = manager(&["r1", "r2"]);
    manager.connect().await;
    hub.push(
        "UnreadCountChanged",
        json!({"chatCode": "r1", "allUnreadCounts": {"5": 2}}),
    );
    flush(&hub, &store).await;

    manager.stop().await;
    assert!(!manager.is_connected());
    assert!(manager.joined_rooms().is_empty());
    assert!(manager.active_rooms().is_empty());
    assert_eq!(manager.connection_id(), None);
    assert_eq!(manager.desired_rooms(), rooms(&["r1", "r2"]));
    assert_eq!(hub.stops(), 1);

    hub.clear_calls();
    assert_eq!(manager.connect().await, ConnectionState::Connected);
    assert_eq!(hub.starts(), 2);
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r2"]);

    // Dedup cache was cleared with the session.
    hub.push(
        "UnreadCountChanged",
        json!({"chatCode": "r1", "allUnreadCounts": {"5": 2}}),
    );
    flush(&hub, &store).await;
    assert_eq!(store.count("unread:r1:2"), 2);
}

#[tokio::test]
async fn stop_during_connect_discards_late_start() {
    let (manager, hub, _store) = manager(&["r1"]);
    let gate = hub.gate_starts();

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    assert!(wait_until(|| hub.starts() == 1).await);

    manager.stop().await;
    gate.notify_one();

    assert_eq!(pending.await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(hub.calls(JOIN_ROOM).is_empty());
    assert!(hub.calls(JOIN_USER_NOTIFY).is_empty());
}

#[tokio::test]
async fn failed_start_settles_disconnected() {
    let (manager, hub, _store) = manager(&["r1"]);
    hub.fail_starts(true);
    assert_eq!(manager.connect().await, ConnectionState::Disconnected);
    assert!(manager.joined_rooms().is_empty());

    hub.fail_starts(false);
    assert_eq!(manager.connect().await, ConnectionState::Connected);
    assert_eq!(hub.starts(), 2);
}

#[tokio::test]
async fn close_keeps_desired_set_and_triggers_resume() {
    let (manager, hub, _store) = manager(&["r1"]);
    manager.connect().await;

    assert!(!manager.handle_trigger(EnvironmentTrigger::AppForeground).await);
    assert_eq!(hub.starts(), 1);

    hub.close("retries exhausted");
    assert!(wait_until(|| manager.state() == ConnectionState::Disconnected).await);
    assert!(manager.joined_rooms().is_empty());
    assert_eq!(manager.desired_rooms(), rooms(&["r1"]));

    hub.clear_calls();
    assert!(manager.handle_trigger(EnvironmentTrigger::NetworkOnline).await);
    assert_eq!(hub.starts(), 2);
    assert!(manager.is_connected());
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1"]);
}

#[tokio::test]
async fn trigger_during_reconnect_is_ignored() {
    let (manager, hub, _store) = manager(&["r1"]);
    manager.connect().await;
    hub.drop_connection();
    assert!(wait_until(|| manager.state() == ConnectionState::Reconnecting).await);

    assert!(!manager.handle_trigger(EnvironmentTrigger::NetworkOnline).await);
    assert_eq!(hub.starts(), 1);
}

#[tokio::test]
async fn state_transitions_are_published() {
    let (manager, _hub, _store) = manager(&[]);
    let mut states = manager.subscribe_state();
    manager.connect().await;

    let first = states.recv().await.unwrap();
    let second = states.recv().await.unwrap();
    assert_eq!(first.state, ConnectionState::Connecting);
    assert_eq!(second.state, ConnectionState::Connected);
    assert_eq!(second.connection_id.as_deref(), Some("mock-0"));
}

#[tokio::test]
async fn presence_pings_active_room_until_cleared() {
    let (manager, hub, _store) = manager(&["r1"]);
    manager.connect().await;

    manager.set_active_room(Some(RoomId::new("r1"))).await;
    assert!(wait_until(|| hub.calls(PING_ACTIVE_ROOM).len() >= 2).await);
    assert_eq!(manager.active_room(), Some(RoomId::new("r1")));

    manager.set_active_room(None).await;
    let settled = hub.calls(PING_ACTIVE_ROOM).len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.calls(PING_ACTIVE_ROOM).len(), settled);
    assert!(hub.calls(PING_ACTIVE_ROOM).iter().all(|room| room == "r1"));
}

#[tokio::test]
async fn switching_active_room_marks_previous_inactive() {
    let (manager, hub, _store) = manager(&["r1", "r2"]);
    manager.connect().await;

    manager.set_active_room(Some(RoomId::new("r1"))).await;
    manager.set_active_room(Some(RoomId::new("r1"))).await;
    assert!(hub.calls(SET_INACTIVE_IN_ROOM).is_empty());

    manager.set_active_room(Some(RoomId::new("r2"))).await;
    assert_eq!(hub.calls(SET_INACTIVE_IN_ROOM), vec!["r1"]);
    assert!(wait_until(|| hub.calls(PING_ACTIVE_ROOM).contains(&"r2".to_string())).await);

    manager.set_active_room(None).await;
    assert_eq!(hub.calls(SET_INACTIVE_IN_ROOM), vec!["r1", "r2"]);
    assert_eq!(manager.active_room(), None);
}

#[tokio::test]
async fn clearing_active_room_while_disconnected_sends_nothing() {
    let (manager, hub, _store) = manager(&["r1"]);
    manager.set_active_room(Some(RoomId::new("r1"))).await;
    manager.set_active_room(None).await;

    manager.connect().await;
    assert!(hub.calls(SET_INACTIVE_IN_ROOM).is_empty());
    assert!(hub.calls(PING_ACTIVE_ROOM).is_empty());
}

#[tokio::test]
async fn join_reply_after_stop_is_not_recorded() {
    let (manager, hub, _store) = manager(&["r1", "r2", "r3"]);
    let release = hub.hold(JOIN_ROOM, "r3");

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    assert!(wait_until(|| hub.calls(JOIN_ROOM) == vec!["r1", "r2", "r3"]).await);

    manager.stop().await;
    release.notify_one();

    assert_eq!(pending.await.unwrap(), ConnectionState::Disconnected);
    assert!(manager.joined_rooms().is_empty());
    assert!(manager.active_rooms().is_empty());

    hub.clear_calls();
    assert_eq!(manager.connect().await, ConnectionState::Connected);
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r2", "r3"]);
    assert_eq!(manager.joined_rooms(), rooms(&["r1", "r2", "r3"]));
}

#[tokio::test]
async fn join_reply_from_lost_connection_is_rejoined_after_reconnect() {
    let (manager, hub, _store) = manager(&["r1", "r3"]);
    let release = hub.hold(JOIN_ROOM, "r3");

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    assert!(wait_until(|| hub.calls(JOIN_ROOM) == vec!["r1", "r3"]).await);

    hub.drop_connection();
    assert!(wait_until(|| manager.state() == ConnectionState::Reconnecting).await);
    hub.clear_calls();
    hub.restore_connection();
    assert!(wait_until(|| manager.state() == ConnectionState::Connected).await);

    // The old cycle still holds the cycle lock; its reply belongs to the
    // lost connection.
    release.notify_one();
    assert_eq!(pending.await.unwrap(), ConnectionState::Connected);

    assert!(wait_until(|| manager.joined_rooms() == rooms(&["r1", "r3"])).await);
    assert_eq!(hub.calls(JOIN_USER_NOTIFY).len(), 1);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r1", "r3"]);
    assert_eq!(hub.starts(), 1);
}

#[tokio::test]
async fn desired_set_changed_while_reconnecting_is_replayed() {
    let (manager, hub, _store) = manager(&["r1", "r2"]);
    manager.connect().await;

    hub.drop_connection();
    assert!(wait_until(|| manager.state() == ConnectionState::Reconnecting).await);
    hub.clear_calls();
    manager.set_desired_rooms(rooms(&["r2", "r3"])).await;
    assert!(hub.calls(JOIN_ROOM).is_empty());
    assert!(hub.calls(LEAVE_ROOM).is_empty());

    hub.restore_connection();
    assert!(wait_until(|| manager.joined_rooms() == rooms(&["r2", "r3"])).await);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r2", "r3"]);
    // Membership on the lost connection is gone; nothing to leave.
    assert!(hub.calls(LEAVE_ROOM).is_empty());
    assert_eq!(manager.active_rooms(), rooms(&["r2", "r3"]));
}

#[tokio::test]
async fn desired_set_changed_while_connecting_is_replayed() {
    let (manager, hub, _store) = manager(&["r1"]);
    let gate = hub.gate_starts();

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    assert!(wait_until(|| hub.starts() == 1).await);
    assert_eq!(manager.state(), ConnectionState::Connecting);

    manager.set_desired_rooms(rooms(&["a", "b"])).await;
    assert!(hub.calls(JOIN_ROOM).is_empty());

    gate.notify_one();
    assert_eq!(pending.await.unwrap(), ConnectionState::Connected);
    assert_eq!(hub.calls(JOIN_ROOM), vec!["a", "b"]);
    assert_eq!(manager.joined_rooms(), rooms(&["a", "b"]));
}

#[tokio::test]
async fn overlapping_desired_set_changes_run_one_after_another() {
    let (manager, hub, _store) = manager(&["r1"]);
    manager.connect().await;
    hub.clear_calls();
    let release = hub.hold(JOIN_ROOM, "r2");

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.set_desired_rooms(rooms(&["r1", "r2"])).await }
    });
    assert!(wait_until(|| hub.calls(JOIN_ROOM) == vec!["r2"]).await);

    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.set_desired_rooms(rooms(&["r3"])).await }
    });
    assert!(wait_until(|| manager.desired_rooms() == rooms(&["r3"])).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hub.calls(JOIN_ROOM), vec!["r2"]);
    assert!(hub.calls(LEAVE_ROOM).is_empty());

    release.notify_one();
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(hub.calls(JOIN_ROOM), vec!["r2", "r3"]);
    assert_eq!(hub.calls(LEAVE_ROOM), vec!["r1", "r2"]);
    assert_eq!(manager.joined_rooms(), rooms(&["r3"]));
    assert_eq!(manager.active_rooms(), rooms(&["r3"]));
}
