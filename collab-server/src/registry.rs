//! Room registry: room id → shared document, fan-out group and metadata.
//!
//! Architecture:
//! ```text
//!            get_or_create / join
//! conn ───────────────┐
//! conn ───────────────┼──► RwLock<HashMap<room id, RoomEntry>>
//! conn ───────────────┘          │
//!                                ├── Arc<Room> ── RoomDocument (yrs)
//!                                │             └─ BroadcastGroup
//!                                ├── RoomMetadata (count, activity)
//!                                └── PendingTeardown (reaper timer)
//! ```
//!
//! Every mutation of a room's metadata happens under the map's write lock,
//! and no `.await` ever runs while it is held. Creation uses the
//! double-checked pattern, so racing joins for an unknown room create
//! exactly one document.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::broadcast::BroadcastGroup;
use crate::document::RoomDocument;
use crate::reaper::{PendingTeardown, Reaper};
use crate::stats::ConnectionStats;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Room \"{0}\" does not exist")]
    RoomNotFound(String),
    #[error("Room \"{room}\" is full ({limit} connections)")]
    RoomFull { room: String, limit: usize },
}

/// The shared state of one room.
pub struct Room {
    id: String,
    document: RoomDocument,
    broadcast: BroadcastGroup,
    created_at: SystemTime,
}

impl Room {
    fn new(id: &str, broadcast_capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            document: RoomDocument::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document(&self) -> &RoomDocument {
        &self.document
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Bookkeeping of one room, owned by the registry.
#[derive(Debug, Clone, Copy)]
pub struct RoomMetadata {
    pub created_at: Instant,
    pub connection_count: usize,
    pub last_activity: Instant,
}

impl RoomMetadata {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            connection_count: 0,
            last_activity: now,
        }
    }
}

/// Read-only view of a room for status reports.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: String,
    pub metadata: RoomMetadata,
    pub pending_teardown: bool,
    pub document_version: u64,
}

struct RoomEntry {
    room: Arc<Room>,
    metadata: RoomMetadata,
    teardown: Option<PendingTeardown>,
}

/// Maps room ids to rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomEntry>>,
    stats: Arc<ConnectionStats>,
    reaper: Reaper,
    broadcast_capacity: usize,
    max_peers_per_room: Option<usize>,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new(
        reaper: Reaper,
        stats: Arc<ConnectionStats>,
        broadcast_capacity: usize,
        max_peers_per_room: Option<usize>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats,
            reaper,
            broadcast_capacity,
            max_peers_per_room: max_peers_per_room.map(|n| n.max(1)),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Return the room, creating its document and metadata if unknown.
    ///
    /// A room created here has no connections yet, so it starts in its
    /// grace period: a `record_join` before the timer fires keeps it.
    pub fn get_or_create(self: &Arc<Self>, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        if let Some(entry) = self.rooms.read().get(room_id) {
            return entry.room.clone();
        }

        let mut rooms = self.rooms.write();
        let entry = self.entry_or_create(&mut rooms, room_id);
        let room = entry.room.clone();
        if entry.metadata.connection_count == 0 && entry.teardown.is_none() {
            self.arm_teardown(&mut rooms, room_id);
        }
        room
    }

    /// Count a new connection in `room_id` and cancel any pending teardown.
    ///
    /// Returns the new connection count.
    pub fn record_join(&self, room_id: &str) -> Result<usize, RegistryError> {
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        self.join_entry(room_id, entry)
    }

    /// `get_or_create` followed by `record_join`, under one lock.
    ///
    /// This is what the connection path uses: the room cannot be reaped
    /// between lookup and join.
    pub fn join(&self, room_id: &str) -> Result<Arc<Room>, RegistryError> {
        let mut rooms = self.rooms.write();
        let entry = self.entry_or_create(&mut rooms, room_id);
        self.join_entry(room_id, entry)?;
        Ok(entry.room.clone())
    }

    /// Uncount a connection. At zero the room is handed to the reaper.
    ///
    /// Returns the remaining count, or `None` if the room is unknown.
    pub fn record_leave(self: &Arc<Self>, room_id: &str) -> Option<usize> {
        let mut rooms = self.rooms.write();
        let entry = rooms.get_mut(room_id)?;

        entry.metadata.connection_count = entry.metadata.connection_count.saturating_sub(1);
        entry.metadata.last_activity = Instant::now();
        let remaining = entry.metadata.connection_count;
        log::info!("Connection left room \"{room_id}\" ({remaining} remaining)");

        if remaining == 0 {
            self.arm_teardown(&mut rooms, room_id);
        }
        Some(remaining)
    }

    /// Delete a room whose teardown fired.
    ///
    /// Only removes it if it is still empty and `generation` is still its
    /// pending teardown; otherwise a reconnect won and this is a no-op.
    pub fn remove(&self, room_id: &str, generation: u64) -> bool {
        let mut rooms = self.rooms.write();
        let current = match rooms.get(room_id) {
            Some(entry) => entry,
            None => {
                log::debug!("Teardown of room \"{room_id}\" skipped: already removed");
                return false;
            }
        };

        let still_armed = current
            .teardown
            .as_ref()
            .is_some_and(|t| t.generation() == generation);
        if current.metadata.connection_count > 0 || !still_armed {
            log::debug!("Teardown of room \"{room_id}\" skipped: room is active again");
            return false;
        }

        if let Some(entry) = rooms.remove(room_id) {
            entry.room.document().clear_observers();
        }
        log::info!("Room \"{room_id}\" closed (no active connections)");
        true
    }

    /// Replace a room's document content with an empty document.
    ///
    /// Used when the document refuses updates it should accept: the room
    /// keeps its connections but loses its content.
    pub fn reset(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read();
        match rooms.get(room_id) {
            Some(entry) => {
                entry.room.document().reset();
                log::error!("Room \"{room_id}\" document reset, content discarded");
                true
            }
            None => false,
        }
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).map(|e| e.room.clone())
    }

    pub fn metadata(&self, room_id: &str) -> Option<RoomMetadata> {
        self.rooms.read().get(room_id).map(|e| e.metadata)
    }

    pub fn connection_count(&self, room_id: &str) -> Option<usize> {
        self.metadata(room_id).map(|m| m.connection_count)
    }

    pub fn has_pending_teardown(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .get(room_id)
            .is_some_and(|e| e.teardown.is_some())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Every room, sorted by id.
    pub fn snapshot(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .read()
            .iter()
            .map(|(id, entry)| RoomInfo {
                id: id.clone(),
                metadata: entry.metadata,
                pending_teardown: entry.teardown.is_some(),
                document_version: entry.room.document().version(),
            })
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn grace_period(&self) -> std::time::Duration {
        self.reaper.grace()
    }

    /// Hand an empty room to the reaper, replacing any earlier timer.
    /// Without a runtime to wait on, the room is torn down right away.
    fn arm_teardown(self: &Arc<Self>, rooms: &mut HashMap<String, RoomEntry>, room_id: &str) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = self
            .reaper
            .arm(Arc::downgrade(self), room_id.to_string(), generation);
        match (rooms.get_mut(room_id), pending) {
            (Some(entry), Some(pending)) => {
                if let Some(previous) = entry.teardown.replace(pending) {
                    previous.cancel();
                }
                log::debug!(
                    "Room \"{room_id}\" empty, teardown in {:?}",
                    self.reaper.grace()
                );
            }
            (Some(_), None) => {
                if let Some(entry) = rooms.remove(room_id) {
                    entry.room.document().clear_observers();
                }
                log::info!("Room \"{room_id}\" closed (no active connections)");
            }
            (None, Some(pending)) => pending.cancel(),
            (None, None) => {}
        }
    }

    fn entry_or_create<'a>(
        &self,
        rooms: &'a mut HashMap<String, RoomEntry>,
        room_id: &str,
    ) -> &'a mut RoomEntry {
        // Double-check after acquiring the write lock
        rooms.entry(room_id.to_string()).or_insert_with(|| {
            let room = Arc::new(Room::new(room_id, self.broadcast_capacity));
            let name = room_id.to_string();
            log::debug!(
                "[{name}] Initial content:\n{}\n---",
                room.document().content()
            );
            // Materializing the text on every apply is only worth it when
            // someone reads the log.
            if log::log_enabled!(log::Level::Debug) {
                room.document().observe(move |change| {
                    log::debug!(
                        "[{name}] Current content (v{}):\n{}\n---",
                        change.version,
                        change.content
                    );
                });
            }
            self.stats.room_created();
            log::info!("Room \"{room_id}\" created");
            RoomEntry {
                room,
                metadata: RoomMetadata::new(),
                teardown: None,
            }
        })
    }

    fn join_entry(&self, room_id: &str, entry: &mut RoomEntry) -> Result<usize, RegistryError> {
        if let Some(limit) = self.max_peers_per_room {
            if entry.metadata.connection_count >= limit {
                return Err(RegistryError::RoomFull {
                    room: room_id.to_string(),
                    limit,
                });
            }
        }
        if let Some(pending) = entry.teardown.take() {
            pending.cancel();
            log::debug!("Teardown of room \"{room_id}\" cancelled by rejoin");
        }
        entry.metadata.connection_count += 1;
        entry.metadata.last_activity = Instant::now();
        let count = entry.metadata.connection_count;
        log::info!("Connection joined room \"{room_id}\" ({count} connected)");
        Ok(count)
    }
}
