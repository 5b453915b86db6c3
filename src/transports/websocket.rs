//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] wraps one accepted server-side WebSocket and
//! translates between JSON text frames and the [`Transport`] trait.
//! [`serve_websocket`] is the accept loop the binary runs: it upgrades every
//! TCP connection and attaches it to the session server.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is
//! enabled (it is enabled by default).

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::server::ServerHandle;
use crate::transport::Transport;

/// Type alias for the underlying server-side WebSocket stream.
pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A [`Transport`] backed by an accepted WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future before
/// completion does not consume or lose any frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake on an accepted TCP connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] if the handshake fails. When the underlying
    /// error is an I/O error its [`ErrorKind`](std::io::ErrorKind) is
    /// preserved; all other errors map to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn accept(tcp: TcpStream) -> Result<Self, SessionError> {
        let stream = tokio_tungstenite::accept_async(tcp).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SessionError::Io(std::io::Error::new(kind, e))
        })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-upgraded WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SessionError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }
}

/// Accept WebSocket clients on `listener` and attach each to the server.
///
/// Handshakes run on their own tasks so a slow client cannot stall the accept
/// loop. Returns once the session server has stopped.
///
/// # Errors
///
/// Returns [`SessionError::Io`] if accepting on the listener fails.
pub async fn serve_websocket(
    listener: TcpListener,
    handle: ServerHandle,
) -> Result<(), SessionError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting WebSocket connections");
    }
    loop {
        let (tcp, peer) = listener.accept().await?;
        if handle.is_stopped() {
            debug!("session server stopped; accept loop exiting");
            return Ok(());
        }
        let handle = handle.clone();
        tokio::spawn(async move {
            attach_peer(tcp, peer, handle).await;
        });
    }
}

async fn attach_peer(tcp: TcpStream, peer: SocketAddr, handle: ServerHandle) {
    match WebSocketTransport::accept(tcp).await {
        Ok(transport) => {
            if let Err(e) = handle.attach(transport, Some(peer)) {
                warn!(%peer, "could not attach connection: {e}");
            }
        }
        Err(e) => debug!(%peer, "WebSocket handshake failed: {e}"),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    /// Accept one connection on a local port and return the server-side
    /// transport plus the client stream connected to it.
    async fn accepted_pair() -> (
        WebSocketTransport,
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            WebSocketTransport::accept(tcp).await.unwrap()
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn recv_receives_text_and_skips_binary() {
        let (mut transport, mut client) = accepted_pair().await;
        client
            .send(Message::Binary(vec![0xDE, 0xAD].into()))
            .await
            .unwrap();
        client
            .send(Message::Text("{\"type\":\"ping\"}".into()))
            .await
            .unwrap();

        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "{\"type\":\"ping\"}");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let (mut transport, mut client) = accepted_pair().await;
        client.close(None).await.unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_reaches_client() {
        let (mut transport, mut client) = accepted_pair().await;
        transport.send("{\"type\":\"pong\"}".to_string()).await.unwrap();
        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "{\"type\":\"pong\"}"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let (mut transport, _client) = accepted_pair().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportClosed));
    }

    #[tokio::test]
    async fn accept_rejects_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            tcp.write_all(b"not a websocket\r\n\r\n").await.unwrap();
            tcp
        });
        let (tcp, _) = listener.accept().await.unwrap();
        let err = WebSocketTransport::accept(tcp).await.unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
        drop(client.await.unwrap());
    }
}
