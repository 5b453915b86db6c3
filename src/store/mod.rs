//! Game state snapshot store.
//!
//! Keeps the latest authoritative state (and the optional secret mapping) per
//! room, so a client that lost its transport can be brought back to the
//! current game. Blobs are opaque and every write fully replaces the previous
//! value. Entries are removed by explicit teardown or by
//! [`sweep_expired`](SnapshotStore::sweep_expired) once older than the
//! configured maximum age.
//!
//! Two backends implement [`SnapshotStore`]:
//!
//! - [`MemoryStore`] (always available) — process-local map.
//! - `SharedStore` (feature `shared-store`) — Redis-backed, for deployments
//!   that run more than one server instance.

pub mod memory;
#[cfg(feature = "shared-store")]
pub mod shared;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::ServerConfig;
use crate::protocol::RoomId;

pub use memory::MemoryStore;
#[cfg(feature = "shared-store")]
pub use shared::SharedStore;

/// Errors raised by a snapshot backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored blob could not be encoded or decoded.
    #[error("snapshot encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which backend is serving snapshots. Reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Shared,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// Everything stored for one room.
#[derive(Debug, Clone, PartialEq)]
pub struct GameSnapshot {
    pub state: serde_json::Value,
    pub secret_mapping: Option<serde_json::Value>,
}

/// Snapshot persistence contract.
///
/// Writes are last-write-wins. Reads never evict, even for entries past their
/// maximum age; only a sweep removes them.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Backend kind, for health reporting.
    fn backend(&self) -> StoreBackend;

    /// Replace the game state of `room`.
    async fn save_state(
        &self,
        room: &RoomId,
        state: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_state(&self, room: &RoomId) -> Result<Option<serde_json::Value>, StoreError>;

    /// Replace the secret mapping of `room`.
    async fn save_secret_mapping(
        &self,
        room: &RoomId,
        mapping: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_secret_mapping(
        &self,
        room: &RoomId,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Drop everything stored for `room`. Deleting a missing room is not an error.
    async fn delete_room(&self, room: &RoomId) -> Result<(), StoreError>;

    /// Remove every room whose last write is older than `max_age`, returning
    /// the rooms that were removed.
    async fn sweep_expired(&self, max_age: Duration) -> Result<Vec<RoomId>, StoreError>;

    /// Number of rooms currently holding a game state. A room with only a
    /// secret mapping is not counted.
    async fn snapshot_count(&self) -> Result<usize, StoreError>;

    /// State plus secret mapping, or `None` when no state was ever saved.
    async fn load_snapshot(&self, room: &RoomId) -> Result<Option<GameSnapshot>, StoreError> {
        let Some(state) = self.get_state(room).await? else {
            return Ok(None);
        };
        let secret_mapping = self.get_secret_mapping(room).await?;
        Ok(Some(GameSnapshot {
            state,
            secret_mapping,
        }))
    }
}

/// Build the backend selected by `config`.
///
/// Falls back to [`MemoryStore`] when the shared backend is requested but the
/// crate was built without the `shared-store` feature.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the shared backend cannot connect.
pub async fn connect(config: &ServerConfig) -> Result<Arc<dyn SnapshotStore>, StoreError> {
    match &config.shared_store {
        #[cfg(feature = "shared-store")]
        Some(shared) => {
            let store =
                SharedStore::connect(&shared.url, &shared.key_prefix, config.snapshot_max_age)
                    .await?;
            info!(prefix = %shared.key_prefix, "using shared snapshot store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "shared-store"))]
        Some(_) => {
            tracing::warn!(
                "shared snapshot store requested but the `shared-store` feature is disabled; using memory"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
        None => {
            info!("using in-memory snapshot store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
