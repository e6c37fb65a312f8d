//! # Blackjack Lobby Server
//!
//! Authoritative backend for multiplayer blackjack played by transient
//! WebSocket clients grouped into lobbies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BLACKJACK LOBBY SERVER                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Round engine (no I/O)                     │
//! │  ├── cards.rs    - Card model, hidden sentinel, deck         │
//! │  ├── score.rs    - Hand scoring                              │
//! │  ├── bot.rs      - Bot decision policy                       │
//! │  ├── winner.rs   - End-of-round outcome rules                │
//! │  ├── player.rs   - Player state owner                        │
//! │  ├── dealer.rs   - Dealer hand + hidden projection           │
//! │  ├── round.rs    - Dealing, turn machine, readiness          │
//! │  └── session.rs  - One game per lobby + projections          │
//! │                                                              │
//! │  store/          - Authoritative registry                    │
//! │  ├── mod.rs      - Versioned records, CAS, TTL sweep         │
//! │  └── rate_limit.rs - Per-key fixed-window limiter            │
//! │                                                              │
//! │  network/        - Sockets and fan-out                       │
//! │  ├── server.rs   - Accept loop, per-socket tasks             │
//! │  ├── handlers.rs - Message router + handlers                 │
//! │  ├── protocol.rs - Wire messages + validation                │
//! │  ├── connection.rs - Connection registry                     │
//! │  └── broadcast.rs - Snapshot caches + delivery               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Lobbies and games live in two independent mutex domains inside the
//! [`store::DataStore`]; every mutation runs in a critical section of its
//! domain and bumps the record's version (optimistic locking for
//! cross-read writers). Broadcasts serialize deep-copied snapshots taken
//! under the lock, never live references, so a fan-out can never observe
//! a half-applied write. No lock is held across socket I/O or a timer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use game::{Card, GameSession, GameStatus, PlayerAction, PublicGameState};
pub use network::{
    Broadcaster, ClientMessage, ConnectionManager, GameServer, ServerConfig, ServerMessage,
};
pub use store::{DataStore, Lobby, StoreConfig, StoreError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
