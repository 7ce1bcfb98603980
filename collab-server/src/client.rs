//! WebSocket client for the collaboration server.
//!
//! Keeps a local replica of the room document, runs the client half of the
//! initial sync, and turns server traffic into [`SyncEvent`]s. Used by the
//! integration tests and benchmarks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::document::RoomDocument;
use crate::presence::{PresenceState, PresenceTable};
use crate::protocol::{MessageType, ProtocolError, SyncMessage, SERVER_PEER};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, initial exchange not finished.
    Syncing,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// WebSocket handshake done
    Connected,
    /// The server's diff has been merged into the local document
    Synced,
    /// A remote update was merged into the local document
    RemoteUpdate { peer_id: Uuid, clock: u64 },
    /// A peer's presence changed
    RemotePresence { peer_id: Uuid, state: PresenceState },
    /// A peer left the room
    PeerLeft(Uuid),
    /// Answer to [`SyncClient::send_ping`]
    Pong,
    /// Connection lost or closed
    Disconnected,
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    room: String,
    name: String,

    /// Local replica
    doc: Arc<RoomDocument>,

    /// Presence of the other peers in the room
    peers: Arc<RwLock<PresenceTable>>,

    state: Arc<RwLock<ConnectionState>>,

    /// Per-client sequence stamped on outgoing updates
    clock: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `room` on `server_url` (e.g. `ws://127.0.0.1:8080`).
    pub fn new(server_url: impl Into<String>, room: impl Into<String>, name: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            server_url: server_url.into(),
            room: room.into(),
            name: name.into(),
            doc: Arc::new(RoomDocument::new()),
            peers: Arc::new(RwLock::new(PresenceTable::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// URL this client connects to.
    pub fn url(&self) -> String {
        let name: String = url::form_urlencoded::byte_serialize(self.name.as_bytes()).collect();
        format!(
            "{}/{}?name={name}",
            self.server_url.trim_end_matches('/'),
            self.room
        )
    }

    /// Connect and start the initial sync.
    ///
    /// Spawns a writer task and a reader task. Wait for
    /// [`SyncEvent::Synced`] before relying on the local document.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write() = ConnectionState::Connecting;

        let url = self.url();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Could not connect to {url}: {e}");
                *self.state.write() = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        }));

        *self.state.write() = ConnectionState::Syncing;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: run the client side of the protocol
        let reader = Reader {
            doc: self.doc.clone(),
            peers: self.peers.clone(),
            state: self.state.clone(),
            out_tx,
            event_tx: self.event_tx.clone(),
        };
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if reader.handle(sync_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *reader.state.write() = ConnectionState::Disconnected;
            let _ = reader.event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Insert text locally and send the resulting update.
    pub async fn insert_text(&self, index: u32, text: &str) -> Result<(), ProtocolError> {
        let update = self.doc.insert_text(index, text);
        self.send_update(update).await
    }

    /// Send an encoded Yrs update to the server.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = SyncMessage::update(SERVER_PEER, clock, update);
        self.send_frame(msg.encode()?).await
    }

    /// Replace this client's presence record.
    pub async fn send_presence(&self, state: &PresenceState) -> Result<(), ProtocolError> {
        let clock = self.clock.load(Ordering::Relaxed);
        let msg = SyncMessage::awareness(SERVER_PEER, clock, state)?;
        self.send_frame(msg.encode()?).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::ping(SERVER_PEER).encode()?).await
    }

    /// Send an arbitrary binary frame.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(Message::Binary(frame.into())).await
    }

    /// Send a text frame, which the server rejects.
    pub async fn send_text(&self, text: &str) -> Result<(), ProtocolError> {
        self.send(Message::Text(text.to_string().into())).await
    }

    /// Close the connection with a close frame.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        let result = self.send(Message::Close(None)).await;
        self.outgoing_tx = None;
        result
    }

    async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub fn document(&self) -> &Arc<RoomDocument> {
        &self.doc
    }

    /// Current text of the local replica.
    pub fn content(&self) -> String {
        self.doc.content()
    }

    /// Presence of every other peer, as last reported.
    pub fn peer_presence(&self, peer_id: &Uuid) -> Option<PresenceState> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// State shared with the reader task.
struct Reader {
    doc: Arc<RoomDocument>,
    peers: Arc<RwLock<PresenceTable>>,
    state: Arc<RwLock<ConnectionState>>,
    out_tx: mpsc::Sender<Message>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Reader {
    /// Handle one server message. Errors mean the writer is gone.
    async fn handle(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let event = match msg.msg_type {
            MessageType::SyncStep1 => {
                // Send what the server lacks, then ask for what we lack.
                let diff = self
                    .doc
                    .encode_diff(&msg.payload)
                    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                self.reply(SyncMessage::sync_step2(SERVER_PEER, diff)).await?;
                self.reply(SyncMessage::sync_step1(SERVER_PEER, self.doc.encode_state_vector()))
                    .await?;
                None
            }
            MessageType::SyncStep2 => match self.doc.apply_update(&msg.payload) {
                Ok(_) => {
                    *self.state.write() = ConnectionState::Connected;
                    Some(SyncEvent::Synced)
                }
                Err(e) => {
                    log::warn!("Could not apply server diff: {e}");
                    None
                }
            },
            MessageType::Update => match self.doc.apply_update(&msg.payload) {
                Ok(_) => Some(SyncEvent::RemoteUpdate {
                    peer_id: msg.peer_id,
                    clock: msg.clock,
                }),
                Err(e) => {
                    log::warn!("Could not apply update from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::Awareness => match msg.presence_state() {
                Ok(state) => {
                    self.peers.write().update(msg.peer_id, state.clone());
                    Some(SyncEvent::RemotePresence {
                        peer_id: msg.peer_id,
                        state,
                    })
                }
                Err(e) => {
                    log::warn!("Undecodable presence from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::PeerLeft => {
                self.peers.write().remove(&msg.peer_id);
                Some(SyncEvent::PeerLeft(msg.peer_id))
            }
            MessageType::Pong => Some(SyncEvent::Pong),
            MessageType::Ping => {
                self.reply(SyncMessage::pong(SERVER_PEER)).await?;
                None
            }
        };

        if let Some(event) = event {
            let _ = self.event_tx.send(event).await;
        }
        Ok(())
    }

    async fn reply(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.out_tx
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
