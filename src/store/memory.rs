//! Process-local snapshot backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{SnapshotStore, StoreBackend, StoreError};
use crate::protocol::RoomId;

#[derive(Debug)]
struct Entry {
    state: Option<serde_json::Value>,
    secret_mapping: Option<serde_json::Value>,
    /// Refreshed by every write to either blob.
    saved_at: Instant,
}

impl Entry {
    fn touched() -> Self {
        Self {
            state: None,
            secret_mapping: None,
            saved_at: Instant::now(),
        }
    }
}

/// Snapshot store backed by a map behind a Tokio mutex.
///
/// Timestamps use [`tokio::time::Instant`], so age checks follow the runtime
/// clock (and a paused clock in tests).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<RoomId, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn save_state(
        &self,
        room: &RoomId,
        state: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(room.clone()).or_insert_with(Entry::touched);
        entry.state = Some(state);
        entry.saved_at = Instant::now();
        Ok(())
    }

    async fn get_state(&self, room: &RoomId) -> Result<Option<serde_json::Value>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(room).and_then(|entry| entry.state.clone()))
    }

    async fn save_secret_mapping(
        &self,
        room: &RoomId,
        mapping: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(room.clone()).or_insert_with(Entry::touched);
        entry.secret_mapping = Some(mapping);
        entry.saved_at = Instant::now();
        Ok(())
    }

    async fn get_secret_mapping(
        &self,
        room: &RoomId,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(room)
            .and_then(|entry| entry.secret_mapping.clone()))
    }

    async fn delete_room(&self, room: &RoomId) -> Result<(), StoreError> {
        self.entries.lock().await.remove(room);
        Ok(())
    }

    async fn sweep_expired(&self, max_age: Duration) -> Result<Vec<RoomId>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<RoomId> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.saved_at) > max_age)
            .map(|(room, _)| room.clone())
            .collect();
        for room in &expired {
            entries.remove(room);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired snapshots");
        }
        Ok(expired)
    }

    async fn snapshot_count(&self) -> Result<usize, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|entry| entry.state.is_some()).count())
    }
}
