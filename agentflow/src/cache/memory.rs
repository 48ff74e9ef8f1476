//! In-process cache backend.

use super::{BackendKind, CacheBackend, CacheEntry};
use crate::errors::CacheError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-lifetime cache storage.
///
/// Expired entries are dropped lazily when they are read.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn clear(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn count(&self, prefix: &str) -> Result<usize, CacheError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .count())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        backend
            .set(CacheEntry::new("search:a", json!([1]), Duration::from_secs(60)))
            .await
            .unwrap();

        let entry = backend.get("search:a").await.unwrap().unwrap();
        assert_eq!(entry.value, json!([1]));
        assert!(backend.delete("search:a").await.unwrap());
        assert!(backend.get("search:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_only_touches_prefix() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.set(CacheEntry::new("search:a", json!(1), ttl)).await.unwrap();
        backend.set(CacheEntry::new("search:b", json!(2), ttl)).await.unwrap();
        backend.set(CacheEntry::new("rag:c", json!(3), ttl)).await.unwrap();

        assert_eq!(backend.clear("search:").await.unwrap(), 2);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.count("rag:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped_on_read() {
        let backend = MemoryBackend::new();
        backend
            .set(CacheEntry::new("search:a", json!(1), Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(backend.get("search:a").await.unwrap().is_none());
        assert!(backend.is_empty());
    }
}
