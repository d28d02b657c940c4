//! Single-host reverse proxy with a pluggable outbound transport.
//!
//! The proxy owns routing: its director rewrites each inbound request to
//! the target (scheme, authority, joined path, merged query, `Host`) and
//! strips hop-by-hop headers. The fetch itself is delegated to an
//! `Arc<dyn RoundTrip>`, which is where a [`CachingTransport`] plugs in.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use apiproxy::proxy::ReverseProxy;
//! use apiproxy::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = "http://127.0.0.1:9000/api".parse()?;
//!     let proxy = ReverseProxy::caching(target, None, Duration::from_secs(60))?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(move |req| {
//!         let proxy = proxy.clone();
//!         async move { proxy.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::cache::{Cache, CacheError, MemoryCache};
use crate::http::request::authority;
use crate::http::{Headers, Request, Response, StatusCode};
use crate::transport::{CachingTransport, HttpConnector, RoundTrip};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A reverse proxy that forwards every request to one target URL.
///
/// Cloning is cheap; clones share the transport.
#[derive(Clone)]
pub struct ReverseProxy {
    target: Url,
    transport: Arc<dyn RoundTrip>,
}

impl ReverseProxy {
    /// Creates a non-caching proxy for `target` over the default [`HttpConnector`].
    pub fn new(target: Url) -> Self {
        Self {
            target,
            transport: Arc::new(HttpConnector::default()),
        }
    }

    /// Creates a proxy for `target` whose transport is a [`CachingTransport`].
    ///
    /// When `cache` is `None`, a fresh [`MemoryCache`] with `ttl` is used;
    /// otherwise `ttl` is ignored and the given store keeps its own policy.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTtl`] if a memory cache is created with a
    /// zero `ttl`.
    pub fn caching(
        target: Url,
        cache: Option<Arc<dyn Cache>>,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let cache = match cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::new(ttl)?),
        };
        Ok(Self::new(target).with_transport(Arc::new(CachingTransport::new(cache))))
    }

    /// Replaces the outbound transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = transport;
        self
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Rewrites `request` so it addresses the target.
    pub fn direct(&self, request: &mut Request) {
        let mut url = self.target.clone();
        url.set_path(&join_paths(self.target.path(), request.path()));
        let query = match (self.target.query(), request.query_string()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_owned()),
            (_, Some(b)) => Some(b.to_owned()),
            _ => None,
        };
        url.set_query(query.as_deref());
        url.set_fragment(None);

        request.headers_mut().set("Host", authority(&self.target));
        request.set_url(url);
    }

    /// Proxies one request and always produces a response.
    ///
    /// Transport failures are logged and answered with `502 Bad Gateway`.
    pub async fn handle(&self, mut request: Request) -> Response {
        self.direct(&mut request);
        strip_hop_by_hop(request.headers_mut());

        debug!(method = %request.method(), url = %request.url(), "proxying request");

        match self.transport.round_trip(request).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                warn!(upstream = %self.target, error = %e, "proxy error");
                Response::new(StatusCode::BAD_GATEWAY).text("Bad Gateway")
            }
        }
    }
}

/// Joins two paths with exactly one slash between them.
fn join_paths(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut Headers) {
    let named: Vec<String> = headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
        .collect();
    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
