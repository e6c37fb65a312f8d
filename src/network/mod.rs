//! Networking Module
//!
//! The non-deterministic edge of the server: socket acceptance and
//! per-connection tasks, the connection registry, the wire protocol, and
//! snapshot fan-out. Game logic never reaches in here; handlers call down
//! into the store and the broadcaster reads back out.

pub mod broadcast;
pub mod connection;
pub(crate) mod handlers;
pub mod protocol;
pub mod server;

pub use broadcast::{BroadcastConfig, Broadcaster};
pub use connection::{ConnectionConfig, ConnectionId, ConnectionManager, ConnectionStats};
pub use protocol::{ClientMessage, ServerMessage, ValidationIssue};
pub use server::{GameServer, GameServerError, ServerConfig};
