//! Server configuration and command line.

use clap::Parser;
use std::time::Duration;

/// Room name used when the handshake path names none.
pub const DEFAULT_ROOM: &str = "default";

/// Longest accepted room id, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 256;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to (`host:port`)
    pub bind_addr: String,
    /// Delay between a room's last leave and its teardown
    pub grace_period: Duration,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum live connections per room, `None` for no limit
    pub max_peers_per_room: Option<usize>,
    /// Room used when the handshake path is empty
    pub default_room: String,
    /// Interval of the periodic status report, `None` disables it
    pub status_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "localhost:8080".to_string(),
            grace_period: Duration::from_millis(5000),
            broadcast_capacity: 256,
            max_peers_per_room: None,
            default_room: DEFAULT_ROOM.to_string(),
            status_interval: Some(Duration::from_secs(5 * 60)),
        }
    }
}

impl ServerConfig {
    /// Default configuration bound to `addr`.
    pub fn with_bind_addr(addr: impl Into<String>) -> Self {
        Self {
            bind_addr: addr.into(),
            ..Self::default()
        }
    }
}

/// Command line of the `collab-server` binary. Every flag falls back to an
/// environment variable.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative editing server", long_about = None)]
pub struct Args {
    /// Interface to listen on
    #[arg(long, env = "HOST", default_value = "localhost")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Milliseconds an empty room is kept before teardown
    #[arg(long, env = "COLLAB_GRACE_MS", default_value_t = 5000)]
    pub grace_ms: u64,

    /// Frames buffered per connection before it starts lagging
    #[arg(long, env = "COLLAB_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Seconds between status reports, 0 disables them
    #[arg(long, env = "COLLAB_STATUS_INTERVAL_SECS", default_value_t = 300)]
    pub status_interval_secs: u64,

    /// Maximum connections per room (unlimited if unset)
    #[arg(long, env = "COLLAB_MAX_PEERS_PER_ROOM")]
    pub max_peers_per_room: Option<usize>,

    /// Room used when a client connects to `/`
    #[arg(long, env = "COLLAB_DEFAULT_ROOM", default_value = DEFAULT_ROOM)]
    pub default_room: String,
}

impl Args {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            grace_period: Duration::from_millis(self.grace_ms),
            broadcast_capacity: self.broadcast_capacity,
            max_peers_per_room: self.max_peers_per_room,
            default_room: self.default_room,
            status_interval: (self.status_interval_secs > 0)
                .then(|| Duration::from_secs(self.status_interval_secs)),
        }
    }
}
