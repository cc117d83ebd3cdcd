//! Cache tier for query embeddings and ranked retrieval results
//!
//! Two backends: an in-process LRU with per-entry TTL and an optional
//! Redis backend. Redis failures degrade to the in-memory backend and are
//! never surfaced to callers.

use crate::config::CacheConfig;
use async_trait::async_trait;
use lru::LruCache;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Compute a deterministic cache key from the given parts
pub fn compute_cache_key(parts: &[&str]) -> String {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    format!("{:x}", hasher.finish())
}

/// Key-value backend with TTL semantics
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value; expired entries behave as misses
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Store a value with a TTL
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);

    /// Remove a single entry
    async fn delete(&self, key: &str);

    /// Drop all entries
    async fn clear(&self);
}

/// In-process LRU backend with expiry deadlines
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, (serde_json::Value, Instant)>>,
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of live entries, counting any not yet expired
    pub fn len(&self) -> usize {
        self.entries.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key.to_string(), (value, Instant::now() + ttl));
        }
    }

    async fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.pop(key);
        }
    }

    async fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Redis backend over a reconnecting connection manager
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis; errors here make the caller fall back to memory
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        use redis::AsyncCommands;

        let mut conn = self.manager.clone();
        let data: Option<Vec<u8>> = match conn.get(key).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Redis get failed: {}", e);
                return None;
            }
        };
        data.and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        use redis::AsyncCommands;

        let Ok(serialized) = serde_json::to_vec(&value) else {
            return;
        };
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> =
            conn.set_ex(key, serialized, ttl.as_secs()).await;
        if let Err(e) = result {
            warn!("Redis set failed: {}", e);
        }
    }

    async fn delete(&self, key: &str) {
        use redis::AsyncCommands;

        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = conn.del(key).await;
        if let Err(e) = result {
            warn!("Redis delete failed: {}", e);
        }
    }

    async fn clear(&self) {
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> =
            redis::cmd("FLUSHDB").query_async(&mut conn).await;
        if let Err(e) = result {
            warn!("Redis clear failed: {}", e);
        }
    }
}

/// Process-wide cache with typed fronts for embeddings and result lists
pub struct RagCache {
    remote: Option<RedisBackend>,
    embeddings: MemoryBackend,
    results: MemoryBackend,
    embedding_ttl: Duration,
    results_ttl: Duration,
}

impl RagCache {
    /// Initialize the cache tier from configuration
    ///
    /// When Redis is enabled but unreachable the cache silently runs on the
    /// in-memory backends.
    pub async fn new(config: &CacheConfig) -> Self {
        let remote = if config.redis_enabled {
            match RedisBackend::connect(&config.redis_url()).await {
                Ok(backend) => {
                    debug!("Redis cache backend connected");
                    Some(backend)
                }
                Err(e) => {
                    warn!("Redis unavailable ({}), using in-memory cache", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            remote,
            embeddings: MemoryBackend::new(config.embedding_max_entries),
            results: MemoryBackend::new(config.results_max_entries),
            embedding_ttl: Duration::from_secs(config.embedding_ttl),
            results_ttl: Duration::from_secs(config.results_ttl),
        }
    }

    /// In-memory cache for tests and callers without a config
    pub fn in_memory() -> Self {
        let config = CacheConfig::default();
        Self {
            remote: None,
            embeddings: MemoryBackend::new(config.embedding_max_entries),
            results: MemoryBackend::new(config.results_max_entries),
            embedding_ttl: Duration::from_secs(config.embedding_ttl),
            results_ttl: Duration::from_secs(config.results_ttl),
        }
    }

    async fn get_raw(&self, mem: &MemoryBackend, key: &str) -> Option<serde_json::Value> {
        if let Some(remote) = &self.remote {
            if let Some(value) = remote.get(key).await {
                return Some(value);
            }
        }
        mem.get(key).await
    }

    async fn set_raw(
        &self,
        mem: &MemoryBackend,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) {
        if let Some(remote) = &self.remote {
            remote.set(key, value.clone(), ttl).await;
        }
        mem.set(key, value, ttl).await;
    }

    /// Look up a cached query embedding by text
    pub async fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let key = format!("emb:{}", compute_cache_key(&[text]));
        let value = self.get_raw(&self.embeddings, &key).await?;
        serde_json::from_value(value).ok()
    }

    /// Store a query embedding
    pub async fn set_embedding(&self, text: &str, embedding: &[f32]) {
        let key = format!("emb:{}", compute_cache_key(&[text]));
        if let Ok(value) = serde_json::to_value(embedding) {
            self.set_raw(&self.embeddings, &key, value, self.embedding_ttl)
                .await;
        }
    }

    /// Look up a cached ranked-result list by retrieval key
    pub async fn get_results<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = format!("res:{key}");
        let value = self.get_raw(&self.results, &key).await?;
        serde_json::from_value(value).ok()
    }

    /// Store a ranked-result list
    pub async fn set_results<T: Serialize>(&self, key: &str, results: &T) {
        let key = format!("res:{key}");
        if let Ok(value) = serde_json::to_value(results) {
            self.set_raw(&self.results, &key, value, self.results_ttl)
                .await;
        }
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        if let Some(remote) = &self.remote {
            remote.clear().await;
        }
        self.embeddings.clear().await;
        self.results.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_deterministic() {
        let key1 = compute_cache_key(&["backup window", "5", "0.28"]);
        let key2 = compute_cache_key(&["backup window", "5", "0.28"]);
        assert_eq!(key1, key2, "Same inputs should produce same cache key");

        let key3 = compute_cache_key(&["backup window", "10", "0.28"]);
        assert_ne!(key1, key3, "Different inputs should produce different keys");
    }

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new(10);

        assert!(backend.get("k").await.is_none());

        backend
            .set("k", serde_json::json!([0.1, 0.2]), Duration::from_secs(60))
            .await;
        assert_eq!(backend.get("k").await, Some(serde_json::json!([0.1, 0.2])));

        backend.delete("k").await;
        assert!(backend.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_ttl_expiry() {
        let backend = MemoryBackend::new(10);

        backend
            .set("k", serde_json::json!(1), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.get("k").await.is_none(), "Expired entry must miss");
    }

    #[tokio::test]
    async fn test_memory_backend_lru_eviction() {
        let backend = MemoryBackend::new(2);

        backend
            .set("a", serde_json::json!(1), Duration::from_secs(60))
            .await;
        backend
            .set("b", serde_json::json!(2), Duration::from_secs(60))
            .await;
        backend
            .set("c", serde_json::json!(3), Duration::from_secs(60))
            .await;

        assert!(backend.get("a").await.is_none(), "LRU entry must be evicted");
        assert!(backend.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_embedding_front() {
        let cache = RagCache::in_memory();

        assert!(cache.get_embedding("what is rust").await.is_none());

        cache.set_embedding("what is rust", &[0.5, -0.25]).await;
        let cached = cache.get_embedding("what is rust").await;
        assert_eq!(cached, Some(vec![0.5, -0.25]));
    }

    #[tokio::test]
    async fn test_results_front_typed() {
        let cache = RagCache::in_memory();

        cache
            .set_results("q1", &vec!["alpha".to_string(), "beta".to_string()])
            .await;
        let hit: Option<Vec<String>> = cache.get_results("q1").await;
        assert_eq!(hit, Some(vec!["alpha".to_string(), "beta".to_string()]));

        cache.clear().await;
        let miss: Option<Vec<String>> = cache.get_results("q1").await;
        assert!(miss.is_none());
    }
}
