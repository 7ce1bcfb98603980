//! Deferred teardown of idle rooms.
//!
//! When a room's last connection leaves, the registry arms a one-shot timer
//! instead of deleting the room. If someone rejoins before it fires, the
//! join cancels it. Each arm carries a generation number; the registry only
//! honours a fire whose generation is still the room's current one, so an
//! aborted timer that already woke up, or a re-armed one, can never delete a
//! room that was rejoined in between.

use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::registry::RoomRegistry;

/// Default delay between a room emptying and its teardown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);

/// A scheduled teardown for one room.
#[derive(Debug)]
pub struct PendingTeardown {
    generation: u64,
    armed_at: Instant,
    handle: AbortHandle,
}

impl PendingTeardown {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn armed_at(&self) -> Instant {
        self.armed_at
    }

    /// Stop the timer. Safe to call after it has already fired.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Schedules room teardowns after a grace period.
#[derive(Debug, Clone)]
pub struct Reaper {
    grace: Duration,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Reaper {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Schedule a check of `room_id` after the grace period.
    ///
    /// On fire the registry removes the room only if it is still empty and
    /// `generation` is still its pending teardown. Returns `None` outside a
    /// tokio runtime, where nothing can be scheduled.
    pub fn arm(
        &self,
        registry: Weak<RoomRegistry>,
        room_id: String,
        generation: u64,
    ) -> Option<PendingTeardown> {
        let runtime = Handle::try_current().ok()?;
        let grace = self.grace;
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            match registry.upgrade() {
                Some(registry) => {
                    registry.remove(&room_id, generation);
                }
                None => log::debug!("Registry gone before teardown of room \"{room_id}\""),
            }
        });
        Some(PendingTeardown {
            generation,
            armed_at: Instant::now(),
            handle: task.abort_handle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_arm_outside_runtime() {
        let reaper = Reaper::default();
        assert_eq!(reaper.grace(), Duration::from_millis(5000));
        assert!(reaper.arm(Weak::new(), "room".into(), 1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_with_dropped_registry_is_noop() {
        let reaper = Reaper::new(Duration::from_millis(10));
        let pending = reaper.arm(Weak::new(), "room".into(), 7).unwrap();
        assert_eq!(pending.generation(), 7);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Cancelling a fired timer is harmless.
        pending.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire_keeps_room() {
        let registry = Arc::new(RoomRegistry::new(
            Reaper::new(Duration::from_millis(100)),
            Default::default(),
            16,
            None,
        ));
        registry.join("doc").unwrap();
        registry.record_leave("doc");
        assert!(registry.has_pending_teardown("doc"));

        registry.join("doc").unwrap();
        assert!(!registry.has_pending_teardown("doc"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.connection_count("doc"), Some(1));
    }
}
