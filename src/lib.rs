//! # apiproxy
//!
//! A private HTTP caching transport, and a single-host reverse proxy that
//! uses it to cache responses from the backend it fronts.
//!
//! Cacheable requests (`GET`/`HEAD` without `Range`) are answered from a
//! [`Cache`] while the stored entry is within its TTL; everything else is
//! forwarded to the underlying transport. Responses are stored in their
//! HTTP wire form. Responses served from the cache carry
//! [`X_FROM_CACHE`]`: 1`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use apiproxy::{CachingTransport, MemoryCache, Request, RoundTrip};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Arc::new(MemoryCache::new(Duration::from_secs(60))?);
//!     let transport = CachingTransport::new(cache);
//!
//!     let response = transport
//!         .round_trip(Request::get("http://127.0.0.1:9000/items")?)
//!         .await?;
//!     println!("{} ({} bytes)", response.status(), response.bytes().len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
pub mod transport;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{Cache, CacheError, MemoryCache};
pub use config::{ConfigError, ProxyConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::ReverseProxy;
pub use server::{Server, ServerError};
pub use transport::{
    CachingTransport, HttpConnector, RoundTrip, TransportError, X_CACHEABLE, X_FROM_CACHE,
};
