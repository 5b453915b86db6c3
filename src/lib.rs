//! # UNO Session Server
//!
//! Session and reconnection backbone for real-time multiplayer UNO rooms.
//!
//! The server tracks who is present in each room, tells a dropped transport
//! apart from a real departure, keeps the latest game state so it survives an
//! outage, and brings a reconnecting client back to the current game.
//!
//! ## Features
//!
//! - **Grace period** — a lost transport holds the player's seat for a
//!   configurable window before the room is told they left
//! - **Snapshot recovery** — the last authoritative state (and secret mapping)
//!   is pushed to a player who comes back
//! - **Transport-agnostic** — implement the [`Transport`] trait for any backend;
//!   the default `transport-websocket` feature provides `WebSocketTransport`
//! - **Swappable store** — in-memory by default, Redis with `shared-store`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use uno_session_server::{store, ServerConfig, SessionServer};
//!
//! let config = ServerConfig::from_env()?;
//! let store = store::connect(&config).await?;
//! let mut server = SessionServer::start(&config, store);
//!
//! let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
//! uno_session_server::transports::serve_websocket(listener, server.handle()).await?;
//! ```

pub mod config;
pub mod error;
pub mod error_codes;
#[cfg(feature = "health-http")]
pub mod health;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use config::ServerConfig;
pub use error::SessionError;
pub use error_codes::ErrorCode;
pub use hub::{HealthReport, SessionHub};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{ServerHandle, SessionServer};
pub use store::{MemoryStore, SnapshotStore};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
