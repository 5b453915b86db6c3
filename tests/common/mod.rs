#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for UNO session server integration tests.
//!
//! Provides a channel-backed [`MockTransport`] and a [`MockPeer`] that plays
//! the client side of it, plus helpers for building client frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use uno_session_server::protocol::{ClientMessage, ServerMessage};
use uno_session_server::{
    MemoryStore, ServerConfig, ServerHandle, SessionError, SessionServer, Transport,
};

/// How long [`MockPeer::next`] waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── MockTransport ───────────────────────────────────────────────────

/// Server side of an in-process connection.
///
/// Frames written by the server are forwarded to the paired [`MockPeer`];
/// frames the peer sends come back out of `recv()`. Dropping the peer's
/// sender ends the stream, which the server sees as a transport close.
pub struct MockTransport {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        self.to_client
            .send(message)
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        self.from_client.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.from_client.close();
        Ok(())
    }
}

// ── MockPeer ────────────────────────────────────────────────────────

/// Client side of a [`MockTransport`].
pub struct MockPeer {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (MockTransport, Self) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        (
            MockTransport {
                from_client,
                to_client,
            },
            Self {
                to_server: Some(to_server),
                from_server,
            },
        )
    }

    /// Attach a fresh peer to a running server.
    pub fn connect(handle: &ServerHandle) -> Self {
        let (transport, peer) = Self::pair();
        handle.attach(transport, None).expect("server is running");
        peer
    }

    /// Send a raw text frame.
    pub fn send_raw(&self, text: impl Into<String>) {
        self.to_server
            .as_ref()
            .expect("peer already closed")
            .send(text.into())
            .expect("server dropped the connection");
    }

    pub fn send(&self, msg: &ClientMessage) {
        self.send_raw(serde_json::to_string(msg).unwrap());
    }

    /// Wait for the next server frame.
    pub async fn next(&mut self) -> ServerMessage {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.from_server.recv())
            .await
            .expect("timed out waiting for a server frame")
            .expect("server closed the connection");
        serde_json::from_str(&text).unwrap()
    }

    /// Skip frames until one matches `pred`, returning it.
    pub async fn next_matching(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let msg = self.next().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    /// Collect every frame already queued for this peer.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_server.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    /// Returns `true` once the server has dropped its end.
    pub async fn is_disconnected(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.from_server.recv()).await,
            Ok(None)
        )
    }

    /// Drop the client's sender, simulating a lost transport.
    pub fn close(&mut self) {
        self.to_server = None;
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Start a server backed by a fresh [`MemoryStore`].
pub fn start_server(config: &ServerConfig) -> SessionServer {
    SessionServer::start(config, Arc::new(MemoryStore::new()))
}

pub fn join(room: &str, identity: &str) -> ClientMessage {
    serde_json::from_value(json!({
        "type": "join",
        "data": { "room": room, "identityHint": { "identity": identity, "name": identity } }
    }))
    .unwrap()
}

pub fn rejoin(room: &str, identity: &str) -> ClientMessage {
    serde_json::from_value(json!({
        "type": "rejoinRoom",
        "data": { "room": room, "identityHint": { "identity": identity } }
    }))
    .unwrap()
}

/// Let spawned tasks run until the runtime is idle.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Join `room` as `identity` and consume the join acknowledgment.
pub async fn join_room(handle: &ServerHandle, room: &str, identity: &str) -> MockPeer {
    let mut peer = MockPeer::connect(handle);
    peer.send(&join(room, identity));
    match peer.next().await {
        ServerMessage::JoinAck(ack) => assert!(ack.error.is_none(), "join failed: {ack:?}"),
        other => panic!("expected joinAck, got {other:?}"),
    }
    peer
}
