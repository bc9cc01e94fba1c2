//! Result Caching
//!
//! Keyed storage for the last successful result per (guard, payload) pair.
//! The orchestrator reads through the cache before dispatching and falls
//! back to a possibly-stale entry when a live call fails.
//!
//! # Keys
//!
//! Keys are a stable content hash: crc32 over the guard name and the
//! canonical JSON payload. `serde_json` keeps object keys ordered, so
//! serializing the payload is already canonical. A crc collision only
//! wastes a cache slot: entries carry the guard name and are verified on
//! read, so a mismatch is treated as a miss, never as a wrong answer.
//!
//! # Backends
//!
//! [`CacheStore`] is the seam. [`MemoryCache`] serves tests and
//! single-process deployments; [`HttpKvCache`] talks to a network
//! key-value store through the pool manager's cache client.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compute the stable cache key for a (guard, payload) pair
#[must_use]
pub fn cache_key(guard: &str, payload: &serde_json::Value) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(guard.as_bytes());
    hasher.update(b"\0");
    hasher.update(payload.to_string().as_bytes());
    format!("{guard}:{:08x}", hasher.finalize())
}

// ============================================================================
// Cache Entry
// ============================================================================

/// A cached guard result with its write timestamp
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Guard that produced the value (verified on read)
    pub guard: String,
    /// The successful result body
    pub value: serde_json::Value,
    /// Unix epoch milliseconds at write time
    pub stored_at_ms: i64,
}

impl CacheEntry {
    /// Create an entry stamped with the current time
    #[must_use]
    pub fn new(guard: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            guard: guard.into(),
            value,
            stored_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Age of the entry
    #[must_use]
    pub fn age(&self) -> Duration {
        let now = chrono::Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(self.stored_at_ms).max(0) as u64)
    }

    /// Whether the entry is within its TTL
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() <= ttl
    }
}

// ============================================================================
// Cache Store Trait
// ============================================================================

/// Cache errors
#[derive(Clone, Debug, Error)]
pub enum CacheError {
    /// The cache backend could not be reached
    #[error("cache backend unavailable: {0}")]
    Backend(String),
    /// The stored entry could not be decoded
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Keyed result storage
///
/// Implementations must tolerate concurrent readers and writers. Staleness
/// policy is the caller's: `get` returns whatever is stored, and the
/// orchestrator applies TTL and stale-tolerance windows itself.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the entry for a key, if any
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store or replace the entry for a key
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Drop the entry for a key
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

// ============================================================================
// In-Memory Cache
// ============================================================================

/// In-process cache with lazy age-based eviction
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    /// Entries older than this are evicted on access. Set to TTL plus the
    /// stale-tolerance window so stale-but-servable entries survive.
    evict_after: Duration,
}

impl MemoryCache {
    /// Create a cache that evicts entries older than `evict_after` on read
    #[must_use]
    pub fn new(evict_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            evict_after,
        }
    }

    /// Number of stored entries (including not-yet-evicted stale ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.age() > self.evict_after {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// HTTP Key-Value Cache
// ============================================================================

/// Network key-value cache backend.
///
/// Talks to a simple KV HTTP API (`GET`/`PUT`/`DELETE /kv/{key}`) through
/// the shared cache client owned by the pool manager. Entries are stored
/// as JSON-serialized [`CacheEntry`] values.
pub struct HttpKvCache {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKvCache {
    /// Create a backend over the given pooled client and KV base URL
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/kv/{key}", self.base_url)
    }
}

#[async_trait]
impl CacheStore for HttpKvCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let response = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::Backend(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let entry: CacheEntry = response
            .json()
            .await
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        Ok(Some(entry))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let response = self
            .client
            .put(self.key_url(key))
            .json(&entry)
            .send()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CacheError::Backend(format!(
                "unexpected status {}",
                response.status()
            )))
        }
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let response = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(CacheError::Backend(format!(
                "unexpected status {}",
                response.status()
            )))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_is_stable() {
        let payload = json!({"text": "hello", "lang": "en"});
        assert_eq!(cache_key("g", &payload), cache_key("g", &payload));
    }

    #[test]
    fn test_cache_key_varies_by_guard_and_payload() {
        let payload = json!({"text": "hello"});
        assert_ne!(cache_key("a", &payload), cache_key("b", &payload));
        assert_ne!(
            cache_key("a", &payload),
            cache_key("a", &json!({"text": "other"}))
        );
    }

    #[test]
    fn test_cache_key_ignores_input_key_order() {
        // serde_json orders map keys, so logically-equal payloads hash the
        // same regardless of construction order.
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(cache_key("g", &a), cache_key("g", &b));
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip_is_bit_identical() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let value = json!({"score": 0.42, "labels": ["spam", "ads"]});
        let entry = CacheEntry::new("g", value.clone());

        cache.put("k", entry.clone()).await.unwrap();
        let read = cache.get("k").await.unwrap().unwrap();

        assert_eq!(read, entry);
        assert_eq!(read.value, value);
    }

    #[tokio::test]
    async fn test_memory_cache_evicts_old_entries_on_read() {
        let cache = MemoryCache::new(Duration::from_millis(0));
        let mut entry = CacheEntry::new("g", json!(1));
        entry.stored_at_ms -= 1_000;

        cache.put("k", entry).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_invalidate() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.put("k", CacheEntry::new("g", json!(1))).await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_entry_freshness_window() {
        let mut entry = CacheEntry::new("g", json!(1));
        assert!(entry.is_fresh(Duration::from_secs(10)));

        entry.stored_at_ms -= 5_000;
        assert!(entry.is_fresh(Duration::from_secs(10)));
        assert!(!entry.is_fresh(Duration::from_secs(1)));
        assert!(entry.age() >= Duration::from_secs(5));
    }

    #[test]
    fn test_http_kv_key_url() {
        let cache = HttpKvCache::new(reqwest::Client::new(), "http://kv:7000/");
        assert_eq!(cache.key_url("abc"), "http://kv:7000/kv/abc");
    }
}
