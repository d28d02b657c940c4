//! Outbound transports, the "perform this request" capability.
//!
//! ## Core types
//!
//! - [`RoundTrip`] — trait implemented by everything that can turn a
//!   [`Request`] into a [`Response`].
//! - [`HttpConnector`] — the default transport, plain HTTP/1.1 over TCP.
//! - [`CachingTransport`] — wraps another transport and answers from a
//!   [`Cache`](crate::cache::Cache) when it can.
//! - [`transport_fn`] — adapts an async closure into a [`RoundTrip`].
//!
//! Transports compose: a [`CachingTransport`] is itself a [`RoundTrip`], and
//! the reverse proxy accepts any `Arc<dyn RoundTrip>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::http::{Request, Response, ResponseError};

pub mod caching;
pub mod connector;

pub use caching::{CachingTransport, X_CACHEABLE, X_FROM_CACHE};
pub use connector::HttpConnector;

/// A pinned, boxed, `Send` future, as returned by [`RoundTrip::round_trip`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced while performing an outbound request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("request URL has no host: {0}")]
    MissingHost(String),

    #[error("invalid response from origin: {0}")]
    Response(#[from] ResponseError),

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },
}

/// Performs one HTTP exchange.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one instance is shared by
///   every task issuing requests through it.
/// - Network and protocol failures are reported as [`TransportError`];
///   any HTTP status, `304` included, is an `Ok` response.
/// - Timeouts and cancellation belong to the implementation and the caller.
pub trait RoundTrip: Send + Sync {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

/// A [`RoundTrip`] built from an async closure. See [`transport_fn`].
#[derive(Clone)]
pub struct TransportFn<F> {
    f: F,
}

/// Wraps `f` so it can be used wherever a [`RoundTrip`] is expected.
///
/// # Examples
///
/// ```
/// use apiproxy::http::{Response, StatusCode};
/// use apiproxy::transport::{transport_fn, RoundTrip, TransportError};
///
/// let origin = transport_fn(|request| async move {
///     Ok::<_, TransportError>(Response::new(StatusCode::OK)
///         .body(format!("you asked for {}", request.path()))
///         .with_request(request))
/// });
/// # let _: &dyn RoundTrip = &origin;
/// ```
pub fn transport_fn<F, Fut>(f: F) -> TransportFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    TransportFn { f }
}

impl<F, Fut> RoundTrip for TransportFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin((self.f)(request))
    }
}
