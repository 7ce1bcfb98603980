//! Process-wide connection statistics.
//!
//! Counters are atomics so the hot path (every frame) never takes a lock.
//! Read them through [`ConnectionStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, created once at startup and shared by handle.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rooms_created: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    updates_applied: AtomicU64,
    malformed_messages: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rooms_created: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub updates_applied: u64,
    pub malformed_messages: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a stray double close must not wrap the gauge.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn room_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn update_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        assert_eq!(ConnectionStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_connection_gauge() {
        let stats = ConnectionStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_active_never_underflows() {
        let stats = ConnectionStats::new();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[test]
    fn test_message_counters() {
        let stats = ConnectionStats::new();
        stats.message_received(10);
        stats.message_received(32);
        stats.update_applied();
        stats.malformed_message();
        stats.room_created();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.bytes_received, 42);
        assert_eq!(snap.updates_applied, 1);
        assert_eq!(snap.malformed_messages, 1);
        assert_eq!(snap.rooms_created, 1);
    }
}
