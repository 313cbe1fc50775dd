//! Shared keyed cache abstraction.
//!
//! Stands in for the external memcached/ArangoDB key-value store
//! (`MEMCACHED_HOST`/`MEMCACHED_PORT` in spec.md §6) that is shared across
//! every worker in the fleet: FX rates, permission snapshots, stats plots,
//! and last-seen timestamps all live here under their own key prefixes.
//!
//! Grounded on `api/rate_limit.rs`'s `Mutex<HashMap<..>>` idiom — the same
//! shape, generalized to carry a TTL per entry instead of a fixed window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// A shared, TTL-expiring keyed string cache.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process TTL cache. Sufficient for single-node operation and for
/// tests; a real deployment would point `Cache` at memcached instead.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for TtlCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::from_secs(60)).await;
        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
