use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use uno_session_server::transports::serve_websocket;
use uno_session_server::{health, store, ServerConfig, SessionServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,uno_session_server=debug")),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let store = store::connect(&config)
        .await
        .context("snapshot store unavailable")?;
    let mut server = SessionServer::start(&config, store);

    let ws_listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let health_listener = TcpListener::bind(config.health_addr)
        .await
        .with_context(|| format!("binding {}", config.health_addr))?;

    info!(ws = %config.bind_addr, health = %config.health_addr, "uno session server ready");

    tokio::select! {
        result = serve_websocket(ws_listener, server.handle()) => {
            if let Err(e) = result {
                error!("WebSocket listener failed: {e}");
            }
        }
        result = health::serve(health_listener, server.handle()) => {
            if let Err(e) = result {
                error!("health listener failed: {e}");
            }
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("ctrl-c received, shutting down");
        }
    }

    server.shutdown().await;
    Ok(())
}
