//! Cache storage: the key/value capability beneath the caching transport.
//!
//! A [`Cache`] maps an opaque string key to the raw wire form of a response.
//! It decides its own eviction policy; the transport only relies on the
//! three operations below. [`MemoryCache`] is the in-process reference
//! implementation with a fixed time-to-live per entry.
//!
//! Stores are injected into each transport as an `Arc<dyn Cache>`, so two
//! transports share entries only when they share the same `Arc`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::http::ResponseError;

pub mod memory;

pub use memory::MemoryCache;

/// Errors raised by cache stores and by cache lookups.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache TTL must be greater than zero, got {0:?}")]
    InvalidTtl(Duration),

    #[error("corrupt cache entry for {key}: {source}")]
    CorruptEntry {
        key: String,
        #[source]
        source: ResponseError,
    },
}

/// A thread-safe store of serialized responses.
///
/// Implementations must never expose a partially written value, and must
/// not block beyond brief lock contention: operations are called from async
/// tasks without being awaited.
pub trait Cache: Send + Sync {
    /// Returns the stored bytes for `key` if present and still valid.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores `value` under `key`, replacing any previous entry.
    fn set(&self, key: &str, value: Bytes);

    /// Removes `key`. Absent keys are ignored.
    fn delete(&self, key: &str);
}

impl<C: Cache + ?Sized> Cache for Arc<C> {
    fn get(&self, key: &str) -> Option<Bytes> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Bytes) {
        (**self).set(key, value);
    }

    fn delete(&self, key: &str) {
        (**self).delete(key);
    }
}
