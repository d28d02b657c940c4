//! Caching transport that answers repeatable requests from a [`Cache`].
//!
//! Only the request decides eligibility: `GET` and `HEAD` without a `Range`
//! header. Freshness is purely the store's TTL; `Cache-Control`, `Vary` and
//! validators are not interpreted, and `If-None-Match` is stripped so every
//! forwarded request is an unconditional fetch.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{BoxFuture, HttpConnector, RoundTrip, TransportError};
use crate::cache::{Cache, CacheError};
use crate::http::{Method, Request, Response, StatusCode};

/// Set to `1` on responses rebuilt from the cache without a network fetch.
pub const X_FROM_CACHE: &str = "X-Aproxy-From-Cache";

/// Set to `1` only on responses that were stored in, or served from, the
/// cache.
///
/// A cacheable request can still come back without it: when the origin
/// answered `304 Not Modified` or an interim `1xx`, or when the response
/// could not be stored because its serialized form did not decode.
pub const X_CACHEABLE: &str = "X-Aproxy-Cacheable";

/// A [`RoundTrip`] that serves `GET`/`HEAD` requests from a cache and
/// populates it from an underlying transport.
///
/// Cloning is cheap; clones share the underlying transport and store.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use apiproxy::cache::MemoryCache;
/// use apiproxy::http::Request;
/// use apiproxy::transport::{CachingTransport, RoundTrip, X_FROM_CACHE};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = Arc::new(MemoryCache::new(Duration::from_secs(300))?);
/// let transport = CachingTransport::new(cache);
///
/// let first = transport.round_trip(Request::get("http://127.0.0.1:8080/a")?).await?;
/// let second = transport.round_trip(Request::get("http://127.0.0.1:8080/a")?).await?;
/// assert!(first.headers().get(X_FROM_CACHE).is_none());
/// assert_eq!(second.headers().get(X_FROM_CACHE), Some("1"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CachingTransport {
    transport: Arc<dyn RoundTrip>,
    cache: Arc<dyn Cache>,
}

impl CachingTransport {
    /// Creates a caching transport over the default [`HttpConnector`].
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            transport: Arc::new(HttpConnector::default()),
            cache,
        }
    }

    /// Replaces the transport used on cache misses.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = transport;
        self
    }

    /// Returns the store this transport reads and writes.
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Looks up a stored response for `request` under `key`.
    ///
    /// A hit is rebuilt against `request` and marked with [`X_FROM_CACHE`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CorruptEntry`] when the stored bytes do not
    /// decode as a response.
    pub fn lookup(&self, key: &str, request: &Request) -> Result<Option<Response>, CacheError> {
        let Some(raw) = self.cache.get(key) else {
            return Ok(None);
        };

        let mut response =
            Response::parse(&raw, request).map_err(|source| CacheError::CorruptEntry {
                key: key.to_owned(),
                source,
            })?;
        mark(&mut response, true);
        Ok(Some(response))
    }

    async fn execute(&self, mut request: Request) -> Result<Response, TransportError> {
        let mut cacheable = is_cacheable(&request);
        let key = cache_key(&request);

        if cacheable {
            match self.lookup(&key, &request) {
                Ok(Some(response)) => {
                    debug!(key = %key, status = response.status().as_u16(), "from-cache");
                    return Ok(response);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping unreadable cache entry");
                    self.cache.delete(&key);
                }
            }
        }

        request.headers_mut().remove("if-none-match");
        let origin = request.clone();

        let response = self.transport.round_trip(request).await?;
        if response.status() == StatusCode::NOT_MODIFIED || response.status().is_interim() {
            cacheable = false;
        }
        if !cacheable {
            return Ok(response);
        }

        // Hand back a copy decoded from the stored bytes, so the caller sees
        // exactly what later hits will see.
        let wire = response.to_wire();
        match Response::parse(&wire, &origin) {
            Ok(mut fresh) => {
                self.cache.set(&key, wire);
                debug!(key = %key, status = fresh.status().as_u16(), "cache-set");
                mark(&mut fresh, false);
                Ok(fresh)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "response not cacheable, serialized form is unreadable");
                Ok(response)
            }
        }
    }
}

impl RoundTrip for CachingTransport {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(self.execute(request))
    }
}

/// Returns `true` if `request` may be answered from, and stored in, the cache.
///
/// The method must be `GET` or `HEAD`, and no non-empty `Range` header may
/// be present.
pub fn is_cacheable(request: &Request) -> bool {
    matches!(request.method(), Method::Get | Method::Head)
        && request
            .headers()
            .get_bytes("range")
            .is_none_or(<[u8]>::is_empty)
}

/// Derives the cache key for `request`.
///
/// A `GET` is keyed by its absolute URL alone. Every other method is keyed
/// as `"<METHOD> <url>"`, so a `HEAD` never collides with a `GET` on the same
/// URL.
pub fn cache_key(request: &Request) -> String {
    match request.method() {
        Method::Get => request.url().as_str().to_owned(),
        method => format!("{method} {}", request.url()),
    }
}

fn mark(response: &mut Response, from_cache: bool) {
    let headers = response.headers_mut();
    if from_cache {
        headers.set(X_FROM_CACHE, "1");
    }
    headers.set(X_CACHEABLE, "1");
}
