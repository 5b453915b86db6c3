//! Redis-backed snapshot backend.
//!
//! Layout, for a key prefix `p`:
//!
//! | Key | Value |
//! |-----|-------|
//! | `p:state:{room}` | JSON game state, TTL = max age |
//! | `p:secret:{room}` | JSON secret mapping, TTL = max age |
//! | `p:rooms` | set of rooms that have been written |
//!
//! Redis evicts the blobs itself once their TTL lapses, so a sweep only has to
//! prune the room index of rooms whose keys are gone.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tracing::debug;

use super::{SnapshotStore, StoreBackend, StoreError};
use crate::protocol::RoomId;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Snapshot store shared between server instances through Redis.
#[derive(Clone)]
pub struct SharedStore {
    conn: MultiplexedConnection,
    prefix: String,
    ttl_secs: u64,
}

impl SharedStore {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        max_age: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl_secs: max_age.as_secs().max(1),
        })
    }

    fn state_key(&self, room: &RoomId) -> String {
        format!("{}:state:{room}", self.prefix)
    }

    fn secret_key(&self, room: &RoomId) -> String {
        format!("{}:secret:{room}", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}:rooms", self.prefix)
    }

    /// Write one blob and refresh the TTL of its sibling, so both blobs of a
    /// room age from the latest write.
    async fn put(
        &self,
        key: String,
        sibling: String,
        room: &RoomId,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, encoded, self.ttl_secs).await?;
        conn.expire::<_, ()>(sibling, ttl).await?;
        conn.sadd::<_, _, ()>(self.index_key(), room.as_str()).await?;
        Ok(())
    }

    async fn fetch(&self, key: String) -> Result<Option<serde_json::Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(StoreError::from)
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("prefix", &self.prefix)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

#[async_trait]
impl SnapshotStore for SharedStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Shared
    }

    async fn save_state(
        &self,
        room: &RoomId,
        state: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.put(self.state_key(room), self.secret_key(room), room, &state)
            .await
    }

    async fn get_state(&self, room: &RoomId) -> Result<Option<serde_json::Value>, StoreError> {
        self.fetch(self.state_key(room)).await
    }

    async fn save_secret_mapping(
        &self,
        room: &RoomId,
        mapping: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.put(self.secret_key(room), self.state_key(room), room, &mapping)
            .await
    }

    async fn get_secret_mapping(
        &self,
        room: &RoomId,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.fetch(self.secret_key(room)).await
    }

    async fn delete_room(&self, room: &RoomId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![self.state_key(room), self.secret_key(room)])
            .await?;
        conn.srem::<_, _, ()>(self.index_key(), room.as_str()).await?;
        Ok(())
    }

    /// Age is enforced by key TTLs set at write time; `max_age` only matters
    /// for the TTL configured at connect.
    async fn sweep_expired(&self, _max_age: Duration) -> Result<Vec<RoomId>, StoreError> {
        let mut conn = self.conn.clone();
        let rooms: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut swept = Vec::new();
        for name in rooms {
            let room = RoomId::new(name);
            let live: usize = conn
                .exists(vec![self.state_key(&room), self.secret_key(&room)])
                .await?;
            if live == 0 {
                conn.srem::<_, _, ()>(self.index_key(), room.as_str()).await?;
                swept.push(room);
            }
        }
        if !swept.is_empty() {
            debug!(count = swept.len(), "pruned expired rooms from shared index");
        }
        Ok(swept)
    }

    /// Counts rooms whose state key is still live; index entries left behind
    /// by an expired TTL or a mapping-only write are not snapshots.
    async fn snapshot_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let rooms: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut count = 0;
        for name in rooms {
            let live: usize = conn.exists(self.state_key(&RoomId::new(name))).await?;
            count += live;
        }
        Ok(count)
    }
}
