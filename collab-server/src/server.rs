//! WebSocket server multiplexing connections onto rooms.
//!
//! Architecture:
//! ```text
//! TCP accept ── peek ──┬── plain HTTP ──► 200 "Collaboration server is running"
//!                      │
//!                      └── WS upgrade ── /<room>?name=<display name>
//!                                │
//!                                ▼
//!                   RoomRegistry::join(room) ── Arc<Room>
//!                                │
//!            ┌───────────────────┼────────────────────┐
//!            ▼                   ▼                    ▼
//!      ws receiver ──► Session::handle     room broadcast ──► ws sender
//!                         │     │                   ▲
//!                         │     └── RoomDocument    │
//!                         └──────── BroadcastGroup ─┘
//! ```
//!
//! Each connection runs in its own task. Teardown (leave the fan-out, tell
//! the registry, update the gauge) runs exactly once however the task ends:
//! clean close, transport error, shutdown or panic.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::{ServerConfig, MAX_ROOM_ID_LEN};
use crate::error::ServerError;
use crate::presence::PresenceState;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::reaper::Reaper;
use crate::registry::{RegistryError, RoomRegistry};
use crate::session::{Session, SessionError};
use crate::stats::{ConnectionStats, StatsSnapshot};

/// Body of the health response.
pub const HEALTH_BODY: &str = "Collaboration server is running\n";

/// Largest request head inspected before deciding upgrade vs. health check.
const MAX_HEAD_LEN: usize = 8192;
/// Time a client gets to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Time connections get to close after shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Rejected handshake targets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    #[error("Room id is longer than {} bytes", MAX_ROOM_ID_LEN)]
    TooLong,
    #[error("Room id contains control characters")]
    ControlCharacter,
}

/// Where a WebSocket handshake asked to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTarget {
    pub room: String,
    pub name: Option<String>,
}

/// Normalize the room id from a request path.
///
/// Leading and trailing `/` are trimmed and any query string is dropped.
/// An empty result maps to `default_room`.
pub fn normalize_room(path: &str, default_room: &str) -> Result<String, RoomIdError> {
    let path = path.split_once('?').map_or(path, |(p, _)| p);
    let room = path.trim_matches('/');
    if room.is_empty() {
        return Ok(default_room.to_string());
    }
    if room.len() > MAX_ROOM_ID_LEN {
        return Err(RoomIdError::TooLong);
    }
    if room.chars().any(char::is_control) {
        return Err(RoomIdError::ControlCharacter);
    }
    Ok(room.to_string())
}

/// Resolve the room and display name from a request's path and query.
pub fn parse_target(path_and_query: &str, default_room: &str) -> Result<HandshakeTarget, RoomIdError> {
    let room = normalize_room(path_and_query, default_room)?;
    let name = path_and_query.split_once('?').and_then(|(_, query)| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "name")
            .map(|(_, value)| value.trim().to_string())
            .filter(|name| !name.is_empty())
    });
    Ok(HandshakeTarget { room, name })
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<RoomRegistry>,
    stats: Arc<ConnectionStats>,
    default_room: Arc<str>,
    shutdown: watch::Receiver<bool>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let stats = Arc::new(ConnectionStats::new());
        let registry = Arc::new(RoomRegistry::new(
            Reaper::new(config.grace_period),
            stats.clone(),
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            stats,
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bind the configured address. Failure here is fatal for the process.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` resolves, then
    /// close every connection with a close frame and log final stats.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        log::info!("Collaboration server listening on {local_addr}");

        let reporter = self.config.status_interval.map(|every| {
            spawn_status_reporter(self.registry.clone(), every, self.shutdown.subscribe())
        });

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let ctx = self.context();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx).await {
                                if e.is_disconnect() {
                                    log::debug!("Connection from {addr} dropped: {e}");
                                } else {
                                    log::error!("Connection error from {addr}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            log::error!("Connection task panicked: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        log::info!("Shutting down, closing {} connections", connections.len());
        self.shutdown.send_replace(true);

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Connections still open after {SHUTDOWN_TIMEOUT:?}, aborting them");
            connections.shutdown().await;
        }
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        let stats = self.stats.snapshot();
        log::info!(
            "Server stopped: {} connections served, {} rooms created, {} rooms active",
            stats.total_connections,
            stats.rooms_created,
            self.registry.room_count()
        );
        Ok(())
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            default_room: Arc::from(self.config.default_room.as_str()),
            shutdown: self.shutdown.subscribe(),
        }
    }
}

/// Leaves the room exactly once, whichever way the connection ends.
struct ConnectionGuard {
    registry: Arc<RoomRegistry>,
    stats: Arc<ConnectionStats>,
    room_id: String,
    closed: AtomicBool,
}

impl ConnectionGuard {
    fn new(registry: Arc<RoomRegistry>, stats: Arc<ConnectionStats>, room_id: String) -> Self {
        stats.connection_opened();
        Self {
            registry,
            stats,
            room_id,
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.record_leave(&self.room_id);
        self.stats.connection_closed();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// How a connection's first bytes were classified.
enum Preamble {
    WebSocket,
    Plain { head_len: usize },
    Empty,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), ServerError> {
    let preamble = match tokio::time::timeout(HEAD_TIMEOUT, sniff(&stream)).await {
        Ok(preamble) => preamble?,
        Err(_) => {
            log::debug!("No request head from {addr} within {HEAD_TIMEOUT:?}");
            return Ok(());
        }
    };
    match preamble {
        Preamble::Empty => return Ok(()),
        Preamble::Plain { head_len } => {
            log::debug!("Health check from {addr}");
            return respond_health(stream, head_len).await;
        }
        Preamble::WebSocket => {}
    }

    let mut target = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
        match parse_target(path, &ctx.default_room) {
            Ok(resolved) => {
                target = Some(resolved);
                Ok(resp)
            }
            Err(e) => {
                log::warn!("Rejected handshake from {addr}: {e}");
                Err(bad_request(e.to_string()))
            }
        }
    })
    .await;
    let (ws_stream, target) = match (handshake, target) {
        (Ok(ws_stream), Some(target)) => (ws_stream, target),
        (Err(e), Some(_)) => return Err(e.into()),
        (Ok(_), None) => return Ok(()),
        (Err(e), None) => {
            log::debug!("Handshake with {addr} failed: {e}");
            return Ok(());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let room = match ctx.registry.join(&target.room) {
        Ok(room) => room,
        Err(e @ RegistryError::RoomFull { .. }) => {
            log::warn!("Refused {addr}: {e}");
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: e.to_string().into(),
            };
            let _ = ws_sender.send(Message::Close(Some(frame))).await;
            return Ok(());
        }
        Err(e) => {
            log::error!("Could not join {addr} to room \"{}\": {e}", target.room);
            return Ok(());
        }
    };

    // Declared before the session so the session leaves the fan-out first.
    let guard = ConnectionGuard::new(ctx.registry.clone(), ctx.stats.clone(), target.room.clone());
    let peer_id = Uuid::new_v4();
    let presence = match &target.name {
        Some(name) => PresenceState::for_peer(peer_id, name.as_str()),
        None => PresenceState::anonymous(peer_id),
    };
    log::info!(
        "WebSocket connection {peer_id} ({}) from {addr} in room \"{}\"",
        presence.name,
        target.room
    );

    let mut session = Session::new(peer_id, room, ctx.stats.clone());
    let (initial, mut room_rx) = match session.start(presence) {
        Ok(started) => started,
        Err(e) => {
            log::error!("Could not start session {peer_id}: {e}");
            return Ok(());
        }
    };
    for msg in initial {
        ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    }

    let mut shutdown = ctx.shutdown.clone();
    let stopping = *shutdown.borrow_and_update();
    if stopping {
        let _ = ws_sender.send(Message::Close(Some(going_away()))).await;
        return Ok(());
    }

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    ctx.stats.message_received(data.len());
                    let replies = match SyncMessage::decode(&data) {
                        Ok(msg) => handle_message(&mut session, &ctx, msg),
                        Err(e) => {
                            reject(&ctx, peer_id, &SessionError::from(e));
                            Vec::new()
                        }
                    };
                    for reply in replies {
                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                    }
                }

                Some(Ok(Message::Text(text))) => {
                    ctx.stats.message_received(text.len());
                    reject(&ctx, peer_id, &SessionError::from(ProtocolError::TextFrame));
                }

                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {peer_id} closed by {addr}");
                    break;
                }

                Some(Ok(_)) => {}

                Some(Err(e)) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            },

            relayed = room_rx.recv() => match relayed {
                Ok(envelope) => {
                    if let Some(frame) = session.forward(&envelope) {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer {peer_id} lagged by {n} messages, resyncing");
                    session.room().broadcast().record_lag(n);
                    match session.resync() {
                        Ok(frames) => {
                            for frame in frames {
                                ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                            }
                        }
                        Err(e) => {
                            log::error!("Could not resync peer {peer_id}: {e}");
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = shutdown.changed() => {
                let _ = ws_sender.send(Message::Close(Some(going_away()))).await;
                break;
            }
        }
    }

    session.close();
    guard.close();
    log::info!("Peer {peer_id} left room \"{}\"", target.room);
    Ok(())
}

/// Run one client message through the session. Failures are logged and
/// never close the connection.
fn handle_message(session: &mut Session, ctx: &ConnectionContext, msg: SyncMessage) -> Vec<SyncMessage> {
    log::debug!(
        "{:?} from {} ({} bytes) in room \"{}\"",
        msg.msg_type,
        session.peer_id(),
        msg.payload.len(),
        session.room().id()
    );
    match session.handle(msg) {
        Ok(replies) => replies,
        Err(SessionError::RoomFailure(e)) => {
            log::error!(
                "Room \"{}\" failed to integrate an update from {}: {e}",
                session.room().id(),
                session.peer_id()
            );
            ctx.registry.reset(session.room().id());
            Vec::new()
        }
        Err(e) => {
            reject(ctx, session.peer_id(), &e);
            Vec::new()
        }
    }
}

fn reject(ctx: &ConnectionContext, peer_id: Uuid, error: &SessionError) {
    ctx.stats.malformed_message();
    log::warn!("Rejected message from {peer_id}: {error}");
}

fn going_away() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Away,
        reason: "Server shutting down".into(),
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Peek at the request head without consuming it, so a WebSocket upgrade
/// can still be handed to the handshake untouched.
async fn sniff(stream: &TcpStream) -> Result<Preamble, ServerError> {
    let mut buf = vec![0u8; MAX_HEAD_LEN];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Preamble::Empty);
        }
        let head = &buf[..n];
        let head_len = match head.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None if n == buf.len() => n,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
        };
        return Ok(if is_upgrade_request(&head[..head_len]) {
            Preamble::WebSocket
        } else {
            Preamble::Plain { head_len }
        });
    }
}

fn is_upgrade_request(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

async fn respond_health(mut stream: TcpStream, head_len: usize) -> Result<(), ServerError> {
    let mut head = vec![0u8; head_len];
    stream.read_exact(&mut head).await?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{HEALTH_BODY}",
        HEALTH_BODY.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Periodically log connection and room activity while there is any.
fn spawn_status_reporter(
    registry: Arc<RoomRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => log_status(&registry),
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn log_status(registry: &RoomRegistry) {
    let stats = registry.stats().snapshot();
    let rooms = registry.snapshot();
    if stats.active_connections == 0 && rooms.is_empty() {
        return;
    }
    log::info!(
        "Status: {} active connections, {} active rooms, {} connections served",
        stats.active_connections,
        rooms.len(),
        stats.total_connections
    );
    for room in rooms {
        log::info!(
            "  room \"{}\": {} connections, idle {}s, version {}{}",
            room.id,
            room.metadata.connection_count,
            room.metadata.last_activity.elapsed().as_secs(),
            room.document_version,
            if room.pending_teardown { ", closing" } else { "" }
        );
    }
}
