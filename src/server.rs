//! Session server event loop.
//!
//! [`SessionServer::start`] spawns one task that owns the [`SessionHub`] and
//! multiplexes, via `tokio::select!`:
//!
//! - inbound connection events (opened, text frame, closed, health query)
//! - grace-period expiries
//! - the periodic snapshot sweep
//! - the shutdown signal
//!
//! Every attached [`Transport`] gets a pump task that forwards the client's
//! frames to the loop and writes the loop's replies back, so frames from one
//! connection are handled in the order they arrived.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ServerConfig::from_env()?;
//! let store = store::connect(&config).await?;
//! let mut server = SessionServer::start(&config, store);
//! let handle = server.handle();
//!
//! handle.attach(transport, Some(peer))?;
//!
//! server.shutdown().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, SessionError};
use crate::hub::{HealthReport, Outbound, SessionHub};
use crate::protocol::{ConnectionId, DisconnectReason, ServerMessage};
use crate::scheduler::Expiry;
use crate::store::SnapshotStore;
use crate::transport::Transport;

/// Events delivered to the event loop.
#[derive(Debug)]
enum Inbound {
    Opened {
        connection: ConnectionId,
        outbound: Outbound,
    },
    Text {
        connection: ConnectionId,
        text: String,
    },
    Closed {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    Health(oneshot::Sender<HealthReport>),
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable handle used by accept loops and the health endpoint.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    keepalive: Duration,
}

impl ServerHandle {
    /// Hand an accepted transport to the server.
    ///
    /// A fresh [`ConnectionId`] is minted and a pump task is spawned for the
    /// transport. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ServerStopped`] if the event loop has exited.
    pub fn attach(
        &self,
        transport: impl Transport,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionId> {
        let connection = ConnectionId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.inbound_tx
            .send(Inbound::Opened {
                connection,
                outbound: outbound_tx,
            })
            .map_err(|_| SessionError::ServerStopped)?;

        match peer {
            Some(peer) => debug!(%connection, %peer, "attaching transport"),
            None => debug!(%connection, "attaching transport"),
        }
        tokio::spawn(connection_pump(
            transport,
            connection,
            outbound_rx,
            self.inbound_tx.clone(),
            self.keepalive,
        ));
        Ok(connection)
    }

    /// Ask the event loop for its health counters.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ServerStopped`] if the event loop has exited.
    pub async fn health(&self) -> Result<HealthReport> {
        let (tx, rx) = oneshot::channel();
        self.inbound_tx
            .send(Inbound::Health(tx))
            .map_err(|_| SessionError::ServerStopped)?;
        rx.await.map_err(|_| SessionError::ServerStopped)
    }

    /// Returns `true` once the event loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.inbound_tx.is_closed()
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Owner of the session event loop task.
pub struct SessionServer {
    handle: ServerHandle,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SessionServer {
    /// Spawn the event loop. Must be called from within a Tokio runtime.
    pub fn start(config: &ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (hub, expiry_rx) = SessionHub::new(config, store);

        info!(
            grace_secs = config.grace_period.as_secs(),
            capacity = config.room_capacity,
            "session server starting"
        );
        let task = tokio::spawn(event_loop(
            hub,
            inbound_rx,
            expiry_rx,
            config.sweep_interval,
            shutdown_rx,
        ));

        Self {
            handle: ServerHandle {
                inbound_tx,
                keepalive: config.keepalive_timeout,
            },
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop the event loop, closing every connection.
    pub async fn shutdown(&mut self) {
        debug!("SessionServer: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("event loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("event loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("event loop aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("stopped", &self.handle.is_stopped())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Event loop ──────────────────────────────────────────────────────

async fn event_loop(
    mut hub: SessionHub,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    mut expiry_rx: mpsc::UnboundedReceiver<Expiry>,
    sweep_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("event loop started");
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            Some(event) = inbound_rx.recv() => match event {
                Inbound::Opened { connection, outbound } => hub.connect(connection, outbound),
                Inbound::Text { connection, text } => hub.handle_text(connection, &text).await,
                Inbound::Closed { connection, reason } => hub.handle_closed(connection, reason),
                Inbound::Health(reply) => {
                    let _ = reply.send(hub.health().await);
                }
            },

            Some(expiry) = expiry_rx.recv() => hub.handle_expiry(&expiry),

            _ = sweep.tick() => hub.sweep().await,
        }
    }

    hub.shutdown();
    info!("event loop exited");
}

// ── Connection pump ─────────────────────────────────────────────────

/// Shuttle frames between one transport and the event loop.
///
/// Exits when:
/// - the client closes the transport or it fails
/// - nothing arrives from the client within `keepalive`
/// - the loop drops the outbound queue (superseded or shutting down)
async fn connection_pump(
    mut transport: impl Transport,
    connection: ConnectionId,
    mut outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    keepalive: Duration,
) {
    let mut deadline = Instant::now() + keepalive;

    let reason = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            error!(%connection, "transport send error: {e}");
                            break DisconnectReason::TransportError;
                        }
                    }
                    Err(e) => error!(%connection, "failed to serialize ServerMessage: {e}"),
                },
                None => {
                    debug!(%connection, "outbound queue closed; closing transport");
                    let _ = transport.close().await;
                    break DisconnectReason::ServerShutdown;
                }
            },

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => {
                    deadline = Instant::now() + keepalive;
                    if inbound_tx.send(Inbound::Text { connection, text }).is_err() {
                        let _ = transport.close().await;
                        break DisconnectReason::ServerShutdown;
                    }
                }
                Some(Err(e)) => {
                    warn!(%connection, "transport receive error: {e}");
                    break DisconnectReason::TransportError;
                }
                None => break DisconnectReason::TransportClose,
            },

            () = tokio::time::sleep_until(deadline) => {
                debug!(%connection, "keepalive deadline passed");
                let _ = transport.close().await;
                break DisconnectReason::PingTimeout;
            }
        }
    };

    debug!(%connection, %reason, "connection pump exited");
    // Loop already gone during shutdown.
    let _ = inbound_tx.send(Inbound::Closed { connection, reason });
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
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Transport whose peer side is a pair of channels.
    struct ChannelTransport {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.to_client
                .send(message)
                .map_err(|_| SessionError::TransportClosed)
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.from_client.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn pair() -> (
        ChannelTransport,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                from_client,
                to_client,
            },
            client_tx,
            client_rx,
        )
    }

    fn server(config: &ServerConfig) -> SessionServer {
        SessionServer::start(config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn ping_round_trip_through_pump() {
        let mut server = server(&ServerConfig::new());
        let (transport, client_tx, mut client_rx) = pair();
        server.handle().attach(transport, None).unwrap();

        client_tx.send(r#"{"type":"ping"}"#.to_string()).unwrap();
        let reply = client_rx.recv().await.unwrap();
        assert_eq!(
            serde_json::from_str::<ServerMessage>(&reply).unwrap(),
            ServerMessage::Pong
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn health_counts_connections() {
        let mut server = server(&ServerConfig::new());
        let handle = server.handle();
        let (transport, client_tx, mut client_rx) = pair();
        handle.attach(transport, None).unwrap();
        client_tx.send(r#"{"type":"ping"}"#.to_string()).unwrap();
        client_rx.recv().await.unwrap();

        let health = handle.health().await.unwrap();
        assert_eq!(health.connections, 1);
        assert_eq!(health.active_rooms, 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn attach_after_shutdown_fails() {
        let mut server = server(&ServerConfig::new());
        let handle = server.handle();
        server.shutdown().await;
        assert!(handle.is_stopped());
        let (transport, _tx, _rx) = pair();
        assert!(matches!(
            handle.attach(transport, None),
            Err(SessionError::ServerStopped)
        ));
        assert!(matches!(
            handle.health().await,
            Err(SessionError::ServerStopped)
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_client_queues() {
        let mut server = server(&ServerConfig::new());
        let (transport, _client_tx, mut client_rx) = pair();
        server.handle().attach(transport, None).unwrap();
        server.shutdown().await;
        // The pump drops the transport once its outbound queue closes.
        assert!(client_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_hits_keepalive() {
        let config = ServerConfig::new()
            .with_keepalive_timeout(Duration::from_secs(30))
            .with_grace_period(Duration::from_secs(60));
        let mut server = server(&config);
        let handle = server.handle();

        let (transport, client_tx, mut client_rx) = pair();
        handle.attach(transport, None).unwrap();
        client_tx
            .send(r#"{"type":"join","data":{"room":"r1","identityHint":{"identity":"alice"}}}"#.into())
            .unwrap();
        client_rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let health = handle.health().await.unwrap();
        assert_eq!(health.connections, 0);
        // Seat is held for the grace period.
        assert_eq!(health.active_rooms, 1);
        server.shutdown().await;
    }
}
