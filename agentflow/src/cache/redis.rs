//! Redis-backed shared cache.

use super::{BackendKind, CacheBackend, CacheEntry};
use crate::errors::CacheError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;

/// Cache backend shared across processes through Redis.
///
/// Entries are stored as JSON `{value, created_at, ttl}` with a matching
/// `EX` so Redis evicts them on its own as well.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    /// Creates a backend from a connection URL.
    ///
    /// No connection is made until the first command.
    pub fn new(connection_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(connection_url)
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    // SCAN in batches; KEYS would stall a shared server.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        let iter: redis::AsyncIter<'_, String> = conn
            .scan_match(format!("{prefix}*"))
            .await
            .map_err(unavailable)?;
        Ok(iter.collect().await)
    }
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::BackendUnavailable(e.to_string())
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(key).await.map_err(unavailable)?;
        payload
            .map(|s| {
                serde_json::from_str::<CacheEntry>(&s)
                    .map(|entry| entry.with_key(key))
                    .map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let payload =
            serde_json::to_string(&entry).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let seconds = entry.ttl.ceil().max(1.0) as u64;
        conn.set_ex::<_, _, ()>(&entry.key, payload, seconds)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let deleted: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(deleted > 0)
    }

    async fn clear(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys = self.keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = conn.del(keys).await.map_err(unavailable)?;
        Ok(deleted as usize)
    }

    async fn count(&self, prefix: &str) -> Result<usize, CacheError> {
        Ok(self.keys(prefix).await?.len())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }
}
