//! HTTP/1.1 requests: parsed from the wire on the server side using the
//! [`httparse`] crate, and encoded to origin-form on the client side.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while parsing or building an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    #[error("chunked request bodies are not supported")]
    UnsupportedTransferEncoding,

    #[error("request body of {length} bytes exceeds the limit of {max} bytes")]
    BodyTooLarge { length: usize, max: usize },
}

/// An HTTP request addressed by an absolute URL.
///
/// Requests built by a client carry their full target in [`url`](Self::url);
/// requests parsed by the server derive the authority from the `Host` header.
///
/// # Examples
///
/// ```
/// use apiproxy::http::{Method, Request};
///
/// let request = Request::get("http://api.example.com/items?page=2")
///     .unwrap()
///     .header("Accept", "application/json");
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/items");
/// assert_eq!(request.query_string(), Some("page=2"));
/// assert_eq!(request.headers().get("accept"), Some("application/json"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Largest `Content-Length` [`parse`](Self::parse) will wait for (8 MiB).
    pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

    /// Creates an HTTP/1.1 request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a `GET` request for an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidUrl`] if `url` is not an absolute URL.
    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::Get, Url::parse(url)?))
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Accepts both origin-form (`GET /path`) and absolute-form
    /// (`GET http://host/path`) targets. For origin-form the authority comes
    /// from the `Host` header, falling back to `localhost`.
    ///
    /// Returns the parsed `Request` and the number of bytes it occupied in
    /// `buf`, body included.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — the head or the declared body has not fully arrived.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    /// - [`RequestError::UnsupportedTransferEncoding`] — the body is chunked.
    /// - [`RequestError::InvalidContentLength`] — `Content-Length` is not a decimal length.
    /// - [`RequestError::BodyTooLarge`] — the declared body exceeds [`MAX_BODY_SIZE`](Self::MAX_BODY_SIZE).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(m) => m.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            header_map.insert(header.name, header.value);
        }

        if header_map.has_token("transfer-encoding", "chunked") {
            return Err(RequestError::UnsupportedTransferEncoding);
        }

        let content_length = match header_map.get_bytes("content-length") {
            Some(raw) => parse_content_length(raw)?,
            None => 0,
        };
        if content_length > Self::MAX_BODY_SIZE {
            return Err(RequestError::BodyTooLarge {
                length: content_length,
                max: Self::MAX_BODY_SIZE,
            });
        }

        let total = body_offset
            .checked_add(content_length)
            .ok_or_else(|| RequestError::InvalidContentLength(content_length.to_string()))?;
        if buf.len() < total {
            return Err(RequestError::Incomplete);
        }

        let url = resolve_target(target, header_map.get("host"))?;
        let body = Bytes::copy_from_slice(&buf[body_offset..total]);

        Ok((
            Self {
                method,
                url,
                version,
                headers: header_map,
                body,
            },
            total,
        ))
    }

    /// Serializes the request in origin-form for sending to `url`'s host.
    ///
    /// The `Host` header is written first, taken from the headers if present
    /// and derived from the URL otherwise. `Connection: close` is always sent
    /// because the connector opens one connection per request.
    pub fn encode(&self) -> BytesMut {
        let mut target = self.url.path().to_owned();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }

        let estimated_size = 64 + target.len() + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(format!("{} {target} HTTP/1.1\r\n", self.method).as_bytes());

        let host = match self.headers.get("host") {
            Some(host) => host.to_owned(),
            None => authority(&self.url),
        };
        buf.put(format!("Host: {host}\r\n").as_bytes());

        self.headers.write_to(&mut buf, |name| {
            ["host", "connection", "content-length"]
                .iter()
                .any(|skip| name.eq_ignore_ascii_case(skip))
        });

        buf.put(&b"Connection: close\r\n"[..]);
        if !self.body.is_empty() || self.method.expects_body() {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());

        buf
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replaces the request URL. Used by the reverse proxy's director.
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.url.query()
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version == 1 || self.headers.has_token("connection", "keep-alive")
    }
}

// Parses a `Content-Length` value: ASCII digits with optional surrounding whitespace.
fn parse_content_length(raw: &[u8]) -> Result<usize, RequestError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<usize>().ok())
        .ok_or_else(|| {
            RequestError::InvalidContentLength(String::from_utf8_lossy(raw).into_owned())
        })
}

/// Returns `host[:port]` for `url`, omitting the scheme's default port.
pub(crate) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

// Builds an absolute URL from a request target and the Host header.
fn resolve_target(target: &str, host: Option<&str>) -> Result<Url, RequestError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(Url::parse(target)?);
    }

    let mut url = Url::parse(&format!("http://{}/", host.unwrap_or("localhost")))?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    url.set_path(path);
    url.set_query(query);
    Ok(url)
}
