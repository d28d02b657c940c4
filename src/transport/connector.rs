//! Plain HTTP/1.1 client transport over Tokio TCP.
//!
//! One connection per request: the request is written with
//! `Connection: close`, and the response is read until it is complete by
//! its own framing or the peer closes. Interim 1xx responses are skipped.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxFuture, RoundTrip, TransportError};
use crate::http::{Request, Response};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Default cap on a buffered origin response (64 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// The default outbound transport.
///
/// Only `http://` URLs are supported; TLS is left to other [`RoundTrip`]
/// implementations.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use apiproxy::http::Request;
/// use apiproxy::transport::{HttpConnector, RoundTrip};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = HttpConnector::new().connect_timeout(Duration::from_secs(5));
/// let response = connector
///     .round_trip(Request::get("http://127.0.0.1:8080/health")?)
///     .await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Option<Duration>,
    max_response_size: usize,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: None,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    /// Fails connection attempts that take longer than `timeout`.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Rejects responses larger than `max_bytes` (head and body).
    #[must_use]
    pub fn max_response_size(mut self, max_bytes: usize) -> Self {
        self.max_response_size = max_bytes;
        self
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let connecting = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| TransportError::ConnectTimeout {
                    addr: addr.to_owned(),
                    timeout,
                })?,
            None => connecting.await,
        };
        result.map_err(|source| TransportError::Connect {
            addr: addr.to_owned(),
            source,
        })
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let url = request.url();
        if url.scheme() != "http" {
            return Err(TransportError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::MissingHost(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");

        let mut stream = self.connect(&addr).await?;
        debug!(addr = %addr, method = %request.method(), url = %url, "sending request");

        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        loop {
            let bytes_read = stream.read_buf(&mut buf).await?;
            let eof = bytes_read == 0;

            if buf.len() > self.max_response_size {
                return Err(TransportError::ResponseTooLarge {
                    max_bytes: self.max_response_size,
                });
            }

            while let Some((response, consumed)) = Response::decode(&buf, Some(&request), eof)? {
                // 1xx interim responses precede the real answer on the same connection.
                if response.status().is_interim() {
                    debug!(
                        addr = %addr,
                        status = response.status().as_u16(),
                        "skipping interim response"
                    );
                    let _ = buf.split_to(consumed);
                    continue;
                }

                debug!(
                    addr = %addr,
                    status = response.status().as_u16(),
                    body_len = response.bytes().len(),
                    "response received"
                );
                return Ok(response.with_request(request));
            }
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundTrip for HttpConnector {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(self.send(request))
    }
}
