//! Result cache for external lookups.
//!
//! [`CacheLayer`] fronts an optional shared [`CacheBackend`] (Redis when the
//! `redis` feature is enabled) with a process-local [`MemoryBackend`]. The
//! first time the shared backend fails, the layer logs a warning and serves
//! every later call from local storage. Callers never see backend errors.

mod fingerprint;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use fingerprint::{fingerprint, SearchFingerprint, SEARCH_NAMESPACE};
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

use crate::config::CacheConfig;
use crate::errors::CacheError;
use crate::utils::unix_timestamp;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A cached value with its expiry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint the value is stored under.
    #[serde(skip)]
    pub key: String,
    /// The cached value.
    pub value: serde_json::Value,
    /// Unix timestamp (seconds) when the entry was stored.
    pub created_at: f64,
    /// Time to live in seconds.
    pub ttl: f64,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(key: impl Into<String>, value: serde_json::Value, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: unix_timestamp(),
            ttl: ttl.as_secs_f64(),
        }
    }

    /// Sets the key, used when decoding a stored payload.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Returns true once more than `ttl` has elapsed since creation.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_timestamp() - self.created_at > self.ttl
    }
}

/// Kind of storage currently serving cache calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Shared Redis instance.
    Redis,
    /// Process-local memory.
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Storage behind the cache layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads an entry, `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores an entry under `entry.key`.
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removes an entry, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every key starting with `prefix`.
    async fn clear(&self, prefix: &str) -> Result<usize, CacheError>;

    /// Counts live keys starting with `prefix`.
    async fn count(&self, prefix: &str) -> Result<usize, CacheError>;

    /// Returns the backend kind.
    fn kind(&self) -> BackendKind;
}

/// Advisory cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub hit_rate: f64,
    /// Storage currently serving calls.
    pub backend_kind: BackendKind,
    /// True if a shared backend was configured but has failed.
    pub degraded: bool,
    /// Live entries under the namespace.
    pub cached_entries: usize,
    /// Default TTL in seconds.
    pub default_ttl: u64,
}

/// Cache with shared storage and a local fallback.
pub struct CacheLayer {
    shared: Option<Arc<dyn CacheBackend>>,
    local: MemoryBackend,
    namespace: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicBool,
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("backend", &self.backend_kind())
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::local(&CacheConfig::default())
    }
}

impl CacheLayer {
    /// Creates a cache that only uses process memory.
    #[must_use]
    pub fn local(config: &CacheConfig) -> Self {
        Self {
            shared: None,
            local: MemoryBackend::new(),
            namespace: config.namespace.clone(),
            default_ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// Creates a cache in front of a shared backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            shared: Some(backend),
            ..Self::local(config)
        }
    }

    /// Builds a cache from configuration.
    ///
    /// Uses Redis when `redis_url` is set and the `redis` feature is
    /// enabled; otherwise, or if the URL is rejected, uses memory.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.redis_url.as_deref() {
            Some(url) => Self::shared_from_url(url, config),
            None => Self::local(config),
        }
    }

    #[cfg(feature = "redis")]
    fn shared_from_url(url: &str, config: &CacheConfig) -> Self {
        match RedisBackend::new(url) {
            Ok(backend) => {
                info!(namespace = %config.namespace, "Using Redis cache backend");
                Self::with_backend(Arc::new(backend), config)
            }
            Err(e) => {
                warn!(error = %e, "Redis cache unavailable, falling back to in-memory cache");
                Self::local(config)
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    fn shared_from_url(_url: &str, config: &CacheConfig) -> Self {
        warn!("redis_url is set but the redis feature is disabled, using in-memory cache");
        Self::local(config)
    }

    /// Returns the key namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the default TTL.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the storage currently serving calls.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.active().map_or(BackendKind::Memory, |b| b.kind())
    }

    /// Looks up a fingerprint. Expired entries count as misses.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = match self.active() {
            Some(shared) => match shared.get(key).await {
                Ok(entry) => entry,
                Err(e) => {
                    self.fall_back(&e);
                    self.local_get(key).await
                }
            },
            None => self.local_get(key).await,
        };

        match entry.filter(|e| !e.is_expired()) {
            Some(entry) => {
                let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(key, hits, "Cache hit");
                Some(entry.value)
            }
            None => {
                let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(key, misses, "Cache miss");
                None
            }
        }
    }

    /// Stores a value. `None` uses the default TTL.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let entry = CacheEntry::new(key, value, ttl.unwrap_or(self.default_ttl));
        if let Some(shared) = self.active() {
            match shared.set(entry.clone()).await {
                Ok(()) => return,
                Err(e) => self.fall_back(&e),
            }
        }
        if let Err(e) = self.local.set(entry).await {
            debug!(key, error = %e, "Local cache write failed");
        }
    }

    /// Returns the cached value or runs `fetch` and caches its success.
    ///
    /// Fetch errors are returned unchanged and nothing is stored.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Removes a single entry.
    pub async fn delete(&self, key: &str) -> bool {
        if let Some(shared) = self.active() {
            match shared.delete(key).await {
                Ok(existed) => return existed,
                Err(e) => self.fall_back(&e),
            }
        }
        self.local.delete(key).await.unwrap_or(false)
    }

    /// Removes every entry under the namespace and resets counters.
    pub async fn clear(&self) {
        let prefix = self.prefix();
        let removed = match self.active() {
            Some(shared) => match shared.clear(&prefix).await {
                Ok(removed) => removed,
                Err(e) => {
                    self.fall_back(&e);
                    self.local.clear(&prefix).await.unwrap_or(0)
                }
            },
            None => self.local.clear(&prefix).await.unwrap_or(0),
        };
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!(namespace = %self.namespace, removed, "Cache cleared");
    }

    /// Returns hit/miss statistics.
    pub async fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };

        let prefix = self.prefix();
        let cached_entries = match self.active() {
            Some(shared) => shared.count(&prefix).await.unwrap_or(0),
            None => self.local.count(&prefix).await.unwrap_or(0),
        };

        CacheStats {
            hits,
            misses,
            hit_rate,
            backend_kind: self.backend_kind(),
            degraded: self.degraded.load(Ordering::Relaxed),
            cached_entries,
            default_ttl: self.default_ttl.as_secs(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn active(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.shared.as_ref()
    }

    async fn local_get(&self, key: &str) -> Option<CacheEntry> {
        self.local.get(key).await.ok().flatten()
    }

    fn fall_back(&self, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %error, "Shared cache backend failed, falling back to in-memory cache");
        }
    }
}
