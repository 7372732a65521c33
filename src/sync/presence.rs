//! Active-room presence pings.
//!
//! While the user has a room open, the hub expects a periodic
//! `PingActiveRoom` so it can suppress push notifications for that room.
//! [`PresenceTask`] owns the background loop; it stops when cancelled or
//! dropped.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::RoomId;

/// Smallest accepted ping interval.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// A running presence loop for one room.
#[derive(Debug)]
pub struct PresenceTask {
    room: RoomId,
    handle: JoinHandle<()>,
}

impl PresenceTask {
    /// Spawns a loop that calls `ping(room)` immediately and then every
    /// `interval`. Each ping is awaited before the next tick.
    pub fn spawn<F, Fut>(room: RoomId, interval: Duration, ping: F) -> Self
    where
        F: Fn(RoomId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let target = room.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ping(target.clone()).await;
            }
        });
        tracing::debug!(room = %room, interval_ms = interval.as_millis() as u64, "presence started");
        Self { room, handle }
    }

    /// Returns the room being pinged.
    #[must_use]
    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    /// Stops the loop and returns the room it was pinging.
    pub fn cancel(self) -> RoomId {
        tracing::debug!(room = %self.room, "presence stopped");
        // Drop aborts.
        self.room.clone()
    }
}

impl Drop for PresenceTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(interval: Duration) -> (PresenceTask, Arc<AtomicUsize>) {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        let task = PresenceTask::spawn(RoomId::new("r1"), interval, move |_room| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (task, pings)
    }

    #[tokio::test(start_paused = true)]
    async fn pings_immediately_then_every_interval() {
        let (task, pings) = counting(Duration::from_secs(20));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 4);
        assert_eq!(task.room().as_str(), "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pinging() {
        let (task, pings) = counting(Duration::from_secs(20));
        tokio::time::sleep(Duration::from_millis(1)).await;
        task.cancel();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }
}
