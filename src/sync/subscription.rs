//! Desired-vs-joined room subscription tracking.
//!
//! Tracks which rooms the UI wants live updates for and which rooms the
//! hub has confirmed on the current connection, and computes the join /
//! leave diff between the two.

use std::collections::BTreeSet;

use crate::domain::RoomId;

/// Rooms to join and leave in one diff cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomDiff {
    /// `desired − joined`, in desired order.
    pub to_join: Vec<RoomId>,
    /// `joined − desired`, in room id order.
    pub to_leave: Vec<RoomId>,
}

impl RoomDiff {
    /// Returns `true` if the cycle needs no RPCs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_join.is_empty() && self.to_leave.is_empty()
    }
}

/// Subscription state for one client.
///
/// The desired set outlives any connection; the joined set belongs to the
/// current connection and is reset whenever server-side membership is
/// lost.
///
/// Every reset starts a new epoch. Confirmations carry the epoch their RPC
/// was issued under and are dropped if membership was reset since, so a
/// reply from a lost connection never lands in the joined set of the next
/// one.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    /// Rooms the UI wants, in the order it listed them.
    desired: Vec<RoomId>,
    /// Rooms the hub confirmed on this connection.
    joined: BTreeSet<RoomId>,
    /// Desired set last reconciled against a live connection.
    active: Vec<RoomId>,
    /// `JoinUserNotify` confirmed on this connection.
    user_notify: bool,
    epoch: u64,
}

impl SubscriptionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the desired set. Duplicates keep their first position.
    ///
    /// Returns `true` if the set changed.
    pub fn set_desired(&mut self, rooms: impl IntoIterator<Item = RoomId>) -> bool {
        let mut desired: Vec<RoomId> = Vec::new();
        for room in rooms {
            if !desired.contains(&room) {
                desired.push(room);
            }
        }
        let changed = desired != self.desired;
        self.desired = desired;
        changed
    }

    /// Computes the join / leave diff against the joined set.
    #[must_use]
    pub fn diff(&self) -> RoomDiff {
        let to_join = self
            .desired
            .iter()
            .filter(|room| !self.joined.contains(*room))
            .cloned()
            .collect();
        let to_leave = self
            .joined
            .iter()
            .filter(|room| !self.desired.contains(*room))
            .cloned()
            .collect();
        RoomDiff { to_join, to_leave }
    }

    /// Records the current desired set as reconciled and returns the diff
    /// to apply together with the epoch it was computed in.
    pub fn begin_cycle(&mut self) -> (u64, RoomDiff) {
        self.active.clone_from(&self.desired);
        (self.epoch, self.diff())
    }

    /// Current membership epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Records a confirmed join issued in `epoch`.
    ///
    /// Returns `false` and records nothing if membership was reset since.
    pub fn mark_joined(&mut self, epoch: u64, room: RoomId) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.joined.insert(room);
        true
    }

    /// Records a confirmed leave issued in `epoch`.
    pub fn mark_left(&mut self, epoch: u64, room: &RoomId) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.joined.remove(room);
        true
    }

    /// Records a confirmed `JoinUserNotify` issued in `epoch`.
    pub fn mark_user_notify(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.user_notify = true;
        true
    }

    /// Returns `true` if `JoinUserNotify` succeeded on this connection.
    #[must_use]
    pub fn has_user_notify(&self) -> bool {
        self.user_notify
    }

    /// Forgets every joined room and the user-notify subscription (the
    /// server lost membership) and starts a new epoch.
    pub fn reset_joined(&mut self) {
        self.joined.clear();
        self.user_notify = false;
        self.epoch += 1;
    }

    /// Clears all per-connection state. The desired set is kept.
    pub fn clear_session(&mut self) {
        self.reset_joined();
        self.active.clear();
    }

    /// Returns the desired set.
    #[must_use]
    pub fn desired(&self) -> &[RoomId] {
        &self.desired
    }

    /// Returns the joined set in room id order.
    #[must_use]
    pub fn joined(&self) -> Vec<RoomId> {
        self.joined.iter().cloned().collect()
    }

    /// Returns the desired set as of the last reconciliation.
    #[must_use]
    pub fn active(&self) -> &[RoomId] {
        &self.active
    }
}
