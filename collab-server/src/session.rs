//! Per-connection synchronization state machine.
//!
//! ```text
//! Connecting ──start()──► Syncing ──(diff sent + diff received)──► Live
//!      │                     │                                      │
//!      └─────────────────────┴──────────────close()─────────────────┴──► Closed
//! ```
//!
//! The session is transport-agnostic: it consumes decoded [`SyncMessage`]s
//! and returns the frames to send back to its own client. Traffic for the
//! other peers of the room goes through the room's [`BroadcastGroup`].
//!
//! The server never decides who wins a conflict: updates are merged by the
//! document and relayed as-is.
//!
//! [`BroadcastGroup`]: crate::broadcast::BroadcastGroup

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::document::DocumentError;
use crate::presence::PresenceState;
use crate::protocol::{MessageType, ProtocolError, SyncMessage, SERVER_PEER};
use crate::registry::Room;
use crate::stats::ConnectionStats;

/// A v1 update with no blocks and an empty delete set: what a client that
/// has nothing new answers to a state vector.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Room resolved, document obtained, nothing exchanged yet.
    Connecting,
    /// Initial state exchange in progress.
    Syncing,
    /// Streaming updates and presence.
    Live,
    /// Terminal.
    Closed,
}

/// Errors raised while handling one client message.
///
/// Everything but `RoomFailure` is local to the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Session has not started")]
    NotStarted,
    #[error("Session is closed")]
    Closed,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unexpected {0:?} message from client")]
    Unexpected(MessageType),
    #[error("Room document failure: {0}")]
    RoomFailure(DocumentError),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Malformed(e.to_string())
    }
}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Integration(_) => SessionError::RoomFailure(e),
            DocumentError::MalformedUpdate(_) | DocumentError::MalformedStateVector(_) => {
                SessionError::Malformed(e.to_string())
            }
        }
    }
}

/// Sync protocol handler for one connection.
pub struct Session {
    peer_id: Uuid,
    room: Arc<Room>,
    stats: Arc<ConnectionStats>,
    state: SessionState,
    diff_sent: bool,
    diff_received: bool,
}

impl Session {
    pub fn new(peer_id: Uuid, room: Arc<Room>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            peer_id,
            room,
            stats,
            state: SessionState::Connecting,
            diff_sent: false,
            diff_received: false,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attach to the room's fan-out and open the initial exchange.
    ///
    /// Returns the frames for the client (the server's state vector and the
    /// presence of peers already in the room) and the receiver carrying
    /// room traffic for this connection.
    pub fn start(
        &mut self,
        presence: PresenceState,
    ) -> Result<(Vec<SyncMessage>, broadcast::Receiver<Envelope>), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::Closed);
        }

        let group = self.room.broadcast();
        let announce = SyncMessage::awareness(self.peer_id, 0, &presence)?;
        let receiver = group.add_peer(self.peer_id, presence);
        group.broadcast(self.peer_id, &announce)?;

        let initial = self.resync()?;
        self.state = SessionState::Syncing;
        log::debug!(
            "Peer {} syncing with room \"{}\"",
            self.peer_id,
            self.room.id()
        );
        Ok((initial, receiver))
    }

    /// Frames that restart the state exchange with the client: the room's
    /// state vector and the presence of every other peer.
    ///
    /// Sent on start, and again whenever this connection's receiver lagged
    /// and dropped room frames. The client answers with what the room lacks
    /// and asks for the diff it lacks, so anything skipped is recovered.
    pub fn resync(&self) -> Result<Vec<SyncMessage>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let mut frames = vec![SyncMessage::sync_step1(
            SERVER_PEER,
            self.room.document().encode_state_vector(),
        )];
        for (peer_id, state) in self.room.broadcast().other_presence(&self.peer_id) {
            frames.push(SyncMessage::awareness(peer_id, 0, &state)?);
        }
        Ok(frames)
    }

    /// Handle one message from this session's client.
    ///
    /// Returns the replies for the client. On error nothing has been applied
    /// to the document and nothing has been sent to other peers.
    pub fn handle(&mut self, msg: SyncMessage) -> Result<Vec<SyncMessage>, SessionError> {
        match self.state {
            SessionState::Connecting => return Err(SessionError::NotStarted),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Syncing | SessionState::Live => {}
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.room.document().encode_diff(&msg.payload)?;
                self.diff_sent = true;
                self.maybe_live();
                Ok(vec![SyncMessage::sync_step2(SERVER_PEER, diff)])
            }

            MessageType::SyncStep2 => {
                self.apply_and_relay(msg.clock, msg.payload)?;
                self.diff_received = true;
                self.maybe_live();
                Ok(Vec::new())
            }

            MessageType::Update => {
                self.apply_and_relay(msg.clock, msg.payload)?;
                Ok(Vec::new())
            }

            MessageType::Awareness => {
                let state = msg.presence_state()?;
                // Relay under our own id, whatever the client claimed.
                let relay = SyncMessage::awareness(self.peer_id, msg.clock, &state)?;
                log::trace!(
                    "Presence update from {} ({}) in room \"{}\"",
                    state.name,
                    self.peer_id,
                    self.room.id()
                );
                self.room.broadcast().set_presence(self.peer_id, state);
                self.room.broadcast().broadcast(self.peer_id, &relay)?;
                Ok(Vec::new())
            }

            MessageType::Ping => Ok(vec![SyncMessage::pong(SERVER_PEER)]),

            MessageType::Pong => Ok(Vec::new()),

            MessageType::PeerLeft => Err(SessionError::Unexpected(MessageType::PeerLeft)),
        }
    }

    /// Decide whether a room frame goes out to this session's client.
    ///
    /// A session never receives its own frames back.
    pub fn forward(&self, envelope: &Envelope) -> Option<Arc<Vec<u8>>> {
        if self.state == SessionState::Closed || envelope.origin == self.peer_id {
            return None;
        }
        Some(envelope.frame.clone())
    }

    /// Leave the room's fan-out. Idempotent; returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        let group = self.room.broadcast();
        if group.remove_peer(&self.peer_id).is_some() {
            let _ = group.broadcast(self.peer_id, &SyncMessage::peer_left(self.peer_id));
        }
        self.state = SessionState::Closed;
        true
    }

    fn apply_and_relay(&mut self, clock: u64, update: Vec<u8>) -> Result<(), SessionError> {
        if update == EMPTY_UPDATE {
            return Ok(());
        }
        self.room.document().apply_update(&update)?;
        self.stats.update_applied();
        let relay = SyncMessage::update(self.peer_id, clock, update);
        self.room.broadcast().broadcast(self.peer_id, &relay)?;
        Ok(())
    }

    fn maybe_live(&mut self) {
        if self.state == SessionState::Syncing && self.diff_sent && self.diff_received {
            self.state = SessionState::Live;
            log::debug!("Peer {} live in room \"{}\"", self.peer_id, self.room.id());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
