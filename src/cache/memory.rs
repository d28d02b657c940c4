//! In-memory cache store with a fixed per-entry TTL and lazy expiry.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Cache, CacheError};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    inserted_at: Instant,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// A [`Cache`] backed by a `HashMap` behind a reader/writer lock.
///
/// Every entry lives for the TTL given at construction, measured from its
/// last [`set`](Cache::set). Expired entries are dropped by the [`get`](Cache::get)
/// that notices them; there is no background sweeper, though
/// [`purge_expired`](Self::purge_expired) can be called explicitly.
///
/// Value and timestamp share one map slot, and the expiry path re-checks the
/// entry under the write lock before removing it, so a `set` racing with an
/// expiring `get` is never lost.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use apiproxy::cache::{Cache, MemoryCache};
///
/// let cache = MemoryCache::new(Duration::from_secs(60)).unwrap();
/// cache.set("http://example.com/", "HTTP/1.1 204 No Content\r\n\r\n".into());
/// assert!(cache.get("http://example.com/").is_some());
///
/// cache.delete("http://example.com/");
/// assert!(cache.get("http://example.com/").is_none());
/// ```
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemoryCache {
    /// Creates an empty store whose entries expire `ttl` after insertion.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTtl`] for a zero TTL, which would make
    /// every entry expire immediately.
    pub fn new(ttl: Duration) -> Result<Self, CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl(ttl));
        }

        debug!(ttl = ?ttl, "memory cache created");

        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, expired ones included until they are noticed.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.ttl));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "purged expired cache entries");
        }
        purged
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        {
            let entries = self.entries.read();
            let entry = entries.get(key)?;
            if !entry.is_expired(self.ttl) {
                return Some(entry.value.clone());
            }
        }

        // Expired under the read lock. Decide again under the write lock: a
        // concurrent `set` may have refreshed the entry in between.
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                trace!(key, "expired cache entry removed");
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Bytes) {
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
        };
        self.entries.write().insert(key.to_owned(), entry);
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn cache(ttl_secs: u64) -> MemoryCache {
        MemoryCache::new(Duration::from_secs(ttl_secs)).unwrap()
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(matches!(
            MemoryCache::new(Duration::ZERO),
            Err(CacheError::InvalidTtl(_))
        ));
    }

    #[test]
    fn set_then_get() {
        let cache = cache(60);
        cache.set("k", Bytes::from_static(b"v1"));
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v1")));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn set_overwrites() {
        let cache = cache(60);
        cache.set("k", Bytes::from_static(b"v1"));
        cache.set("k", Bytes::from_static(b"v2"));
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v2")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = cache(60);
        cache.set("k", Bytes::from_static(b"v"));
        cache.delete("k");
        cache.delete("k");
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_removed_on_get() {
        let cache = cache(10);
        cache.set("k", Bytes::from_static(b"v"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("k").is_some(), "exactly the TTL is still fresh");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_resets_the_timestamp() {
        let cache = cache(10);
        cache.set("k", Bytes::from_static(b"old"));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", Bytes::from_static(b"new"));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = cache(10);
        cache.set("old", Bytes::from_static(b"1"));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("young", Bytes::from_static(b"2"));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("young").is_some());
    }

    #[test]
    fn concurrent_distinct_keys() {
        let cache = Arc::new(cache(60));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("w{worker}-{i}");
                        cache.set(&key, Bytes::from(key.clone()));
                        assert_eq!(cache.get(&key), Some(Bytes::from(key.clone())));
                        if i % 3 == 0 {
                            cache.delete(&key);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for worker in 0..8 {
            for i in 0..200 {
                let key = format!("w{worker}-{i}");
                let expected = (i % 3 != 0).then(|| Bytes::from(key.clone()));
                assert_eq!(cache.get(&key), expected);
            }
        }
    }
}
