//! Fan-out of encoded frames to the other connections of a room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, each
//! subscriber buffers up to `capacity` frames. A subscriber that falls behind
//! further than that lags and skips frames instead of blocking the room.
//!
//! Frames carry the id of the connection that produced them so a receiver
//! can skip its own frames without decoding them.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::presence::{PresenceState, PresenceTable};
use crate::protocol::{ProtocolError, SyncMessage};

/// One encoded frame plus the connection it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
///
/// Also holds the presence of every connection attached to the room, since
/// presence lives exactly as long as the subscription.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    presence: RwLock<PresenceTable>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            presence: RwLock::new(PresenceTable::new()),
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Attach a connection with its initial presence.
    ///
    /// Returns the receiver the connection consumes room traffic from.
    pub fn add_peer(&self, peer_id: Uuid, state: PresenceState) -> broadcast::Receiver<Envelope> {
        // Subscribe under the presence lock so a concurrent broadcast of the
        // newcomer's presence is not missed by peers reading the table.
        let mut presence = self.presence.write();
        presence.update(peer_id, state);
        self.sender.subscribe()
    }

    /// Detach a connection, dropping its presence.
    pub fn remove_peer(&self, peer_id: &Uuid) -> Option<PresenceState> {
        self.presence.write().remove(peer_id)
    }

    /// Replace a connection's presence record.
    pub fn set_presence(&self, peer_id: Uuid, state: PresenceState) -> Option<PresenceState> {
        self.presence.write().update(peer_id, state)
    }

    pub fn presence_of(&self, peer_id: &Uuid) -> Option<PresenceState> {
        self.presence.read().get(peer_id).cloned()
    }

    /// Presence of everyone in the room but `peer_id`.
    pub fn other_presence(&self, peer_id: &Uuid) -> Vec<(Uuid, PresenceState)> {
        self.presence.read().others(peer_id)
    }

    /// Encode once and fan out to every subscriber.
    ///
    /// The origin's own receiver gets the frame too; filtering is the
    /// receiver's job. Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(origin, frame))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_raw(&self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { origin, frame }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.presence.read().len()
    }

    pub fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.presence.read().get(peer_id).is_some()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
