//! Transport abstraction for client connections.
//!
//! The [`Transport`] trait is a bidirectional channel of JSON text frames
//! between the server and one client. Framing is the implementation's job
//! (WebSocket frames, length-prefixed TCP, an in-process channel in tests).
//!
//! # Accepting Connections
//!
//! Accepting is NOT part of this trait. Accept and upgrade the connection
//! externally, then hand it to
//! [`ServerHandle::attach`](crate::server::ServerHandle::attach), which mints
//! a fresh [`ConnectionId`](crate::protocol::ConnectionId) for it.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use uno_session_server::error::SessionError;
//! use uno_session_server::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), SessionError> {
//!         // Write one JSON frame to the client
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SessionError>> {
//!         // Read the next JSON frame; None when the client closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SessionError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SessionError;

/// A bidirectional text message transport to one client.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON message
/// and each call to [`recv`](Transport::recv) returns one.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the connection pump
/// polls it inside `tokio::select!` alongside outbound frames and the
/// keepalive deadline. A cancelled `recv` must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the client.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportSend`] if the message could not be
    /// sent, or [`SessionError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, message: String) -> Result<(), SessionError>;

    /// Receive the next JSON text message from the client.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete message was received
    /// - `Some(Err(e))` — a transport error occurred
    /// - `None` — the client closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, SessionError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), SessionError>;
}
