//! # collab-server: Real-time collaborative editing rooms
//!
//! Clients connect over WebSocket to `ws://host:port/<room>`, exchange Yrs
//! updates and presence, and converge on one shared document per room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │    Binary Proto    │ (multiplexer)│
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │ Session (per connection)
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐      ┌────────┐
//! │ RoomDocument│                    │ RoomRegistry │ ───► │ Reaper │
//! │ (local)     │                    │ room id→Room │      └────────┘
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                                ┌──────────┴─────────┐
//!                                ▼                    ▼
//!                         RoomDocument (yrs)   BroadcastGroup (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`document`]: Adapter over the Yrs document of a room
//! - [`registry`]: Room id → document, metadata and lifecycle
//! - [`session`]: Per-connection sync state machine
//! - [`reaper`]: Grace-period teardown of idle rooms
//! - [`broadcast`]: Room fan-out with lagging receivers
//! - [`presence`]: Per-connection presence records
//! - [`server`]: WebSocket server, health endpoint, shutdown
//! - [`client`]: WebSocket client with a local replica
//! - [`validate`]: Structural check of untrusted Yrs payloads

pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod validate;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use document::{DocumentChange, DocumentError, ObserverId, RoomDocument};
pub use error::ServerError;
pub use presence::{PresenceState, PresenceTable};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use reaper::{PendingTeardown, Reaper};
pub use registry::{RegistryError, Room, RoomInfo, RoomMetadata, RoomRegistry};
pub use server::SyncServer;
pub use session::{Session, SessionError, SessionState};
pub use stats::{ConnectionStats, StatsSnapshot};
