//! Transport implementations for client connections.
//!
//! Concrete [`Transport`](crate::Transport) implementations live behind
//! feature gates:
//!
//! | Feature                | Transport              |
//! |------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example(handle: uno_session_server::ServerHandle) -> std::io::Result<()> {
//! use tokio::net::TcpListener;
//! use uno_session_server::transports::websocket::serve_websocket;
//!
//! let listener = TcpListener::bind("0.0.0.0:3000").await?;
//! serve_websocket(listener, handle).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{serve_websocket, WebSocketTransport};
