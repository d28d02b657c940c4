//! HTTP/1.x responses and their wire codec.
//!
//! [`Response::to_wire`] writes a response exactly as it appears on the
//! wire (status line, headers, blank line, body). That byte form is what the
//! caching transport stores, and [`Response::parse`] turns it back into a
//! response bound to a request. [`Response::decode`] is the incremental form
//! of the same decoder, used while reading from a socket.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, Request, StatusCode};

/// Errors produced while decoding a response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("{0} unexpected bytes after the end of the message")]
    TrailingData(usize),
}

// How the end of a response body is determined.
enum Framing {
    Empty,
    Chunked,
    Length(usize),
    UntilEof,
}

/// An HTTP/1.x response.
///
/// Responses are either built locally with the fluent API, decoded from an
/// origin server, or rebuilt from a cache entry. The body is fully buffered.
///
/// # Examples
///
/// ```
/// use apiproxy::http::{Request, Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let wire = response.to_wire();
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
///
/// let request = Request::get("http://example.com/status").unwrap();
/// let restored = Response::parse(&wire, &request).unwrap();
/// assert_eq!(restored.bytes().as_ref(), br#"{"status":"ok"}"#);
/// assert_eq!(restored.request().unwrap().url().as_str(), "http://example.com/status");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
    request: Option<Arc<Request>>,
}

impl Response {
    /// Maximum number of headers accepted in a response head.
    const MAX_HEADERS: usize = 128;

    /// Creates a new HTTP/1.1 response with the canonical reason phrase and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: 1,
            status,
            reason: status.canonical_reason().to_owned(),
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
            request: None,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a plain-text body and its `Content-Type`.
    #[must_use]
    pub fn text(self, body: impl Into<String>) -> Self {
        self.header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into())
    }

    /// Controls the `Connection` header written by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Binds the response to the request it answers.
    #[must_use]
    pub fn with_request(mut self, request: impl Into<Arc<Request>>) -> Self {
        self.request = Some(request.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the reason phrase as received (or the canonical one for local responses).
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the buffered body.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Drops the body but keeps its length advertised, as an answer to
    /// `HEAD` carries it.
    #[must_use]
    pub fn without_body(mut self) -> Self {
        if !self.body.is_empty() {
            self.headers.set("Content-Length", self.body.len().to_string());
            self.body = Bytes::new();
        }
        self
    }

    /// Returns the request this response answers, if bound.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    /// Serializes the response exactly as it would appear on the wire.
    ///
    /// Headers are written verbatim in their original order, except that
    /// `Transfer-Encoding` is dropped (the body is already decoded) and
    /// `Content-Length` is rewritten to match the buffered body. An empty
    /// body keeps an advertised `Content-Length`, which is how answers to
    /// `HEAD` requests describe the representation.
    pub fn to_wire(&self) -> Bytes {
        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.{} {} {}\r\n",
                self.version,
                self.status.as_u16(),
                self.reason
            )
            .as_bytes(),
        );

        // Headers
        self.headers.write_to(&mut buf, |name| {
            name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
        });

        match self.headers.get_bytes("content-length") {
            Some(declared) if self.body.is_empty() => {
                buf.put(&b"Content-Length: "[..]);
                buf.put(declared.trim_ascii());
                buf.put(&b"\r\n"[..]);
            }
            _ if self.body.is_empty() && !self.status.permits_body() => {}
            _ => buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes()),
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());

        buf.freeze()
    }

    /// Serializes the response for a server connection.
    ///
    /// Replaces any `Connection` header with `keep-alive` or `close` according
    /// to [`keep_alive`](Self::keep_alive), then writes the wire form.
    pub fn into_bytes(mut self) -> BytesMut {
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);
        BytesMut::from(self.to_wire().as_ref())
    }

    /// Rebuilds a complete response from its wire form and binds it to `request`.
    ///
    /// The request's method decides framing (answers to `HEAD` have no body).
    ///
    /// # Errors
    ///
    /// Any [`ResponseError`] if `buf` is not exactly one complete response,
    /// including [`ResponseError::TrailingData`] when bytes follow it.
    pub fn parse(buf: &[u8], request: &Request) -> Result<Self, ResponseError> {
        match Self::decode(buf, Some(request), true)? {
            Some((response, consumed)) if consumed == buf.len() => {
                Ok(response.with_request(request.clone()))
            }
            Some((_, consumed)) => Err(ResponseError::TrailingData(buf.len() - consumed)),
            None => Err(ResponseError::Incomplete),
        }
    }

    /// Incrementally decodes one response from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed. With `eof` set the buffer
    /// is final: a body without explicit framing ends at the end of `buf`,
    /// and a short message is an error instead of `None`.
    ///
    /// A chunked body is decoded and the message normalized to a
    /// `Content-Length` framed one. The returned `usize` is the number of
    /// bytes consumed from `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResponseError`] describing malformed input.
    pub fn decode(
        buf: &[u8],
        request: Option<&Request>,
        eof: bool,
    ) -> Result<Option<(Self, usize)>, ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_resp = httparse::Response::new(&mut headers);

        let head_len = match raw_resp.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial if eof => return Err(ResponseError::Incomplete),
            httparse::Status::Partial => return Ok(None),
        };

        let version = raw_resp
            .version
            .ok_or(ResponseError::MissingField { field: "version" })?;
        let code = raw_resp
            .code
            .ok_or(ResponseError::MissingField { field: "status" })?;
        let status = StatusCode::from_u16(code)?;
        let reason = raw_resp.reason.unwrap_or_default().to_owned();

        let mut header_map = Headers::with_capacity(raw_resp.headers.len());
        for header in raw_resp.headers.iter() {
            header_map.insert(header.name, header.value);
        }

        let is_head = request.is_some_and(|r| r.method() == &Method::Head);
        let framing = if is_head || !status.permits_body() {
            Framing::Empty
        } else if header_map.has_token("transfer-encoding", "chunked") {
            Framing::Chunked
        } else if let Some(raw) = header_map.get_bytes("content-length") {
            let len = std::str::from_utf8(raw)
                .ok()
                .and_then(|text| text.trim().parse::<usize>().ok())
                .ok_or_else(|| {
                    ResponseError::InvalidContentLength(String::from_utf8_lossy(raw).into_owned())
                })?;
            Framing::Length(len)
        } else {
            Framing::UntilEof
        };

        let rest = &buf[head_len..];
        let (body, body_len) = match framing {
            Framing::Empty => (Bytes::new(), 0),
            Framing::Length(expected) if rest.len() >= expected => {
                (Bytes::copy_from_slice(&rest[..expected]), expected)
            }
            Framing::Length(expected) if eof => {
                return Err(ResponseError::Truncated {
                    expected,
                    actual: rest.len(),
                });
            }
            Framing::Length(_) => return Ok(None),
            Framing::Chunked => match decode_chunked(rest)? {
                Some((body, used)) => {
                    header_map.remove("transfer-encoding");
                    header_map.set("Content-Length", body.len().to_string());
                    (Bytes::from(body), used)
                }
                None if eof => return Err(ResponseError::InvalidChunk),
                None => return Ok(None),
            },
            Framing::UntilEof if eof => (Bytes::copy_from_slice(rest), rest.len()),
            Framing::UntilEof => return Ok(None),
        };

        let response = Self {
            version,
            status,
            reason,
            headers: header_map,
            body,
            keep_alive: true,
            request: None,
        };
        Ok(Some((response, head_len + body_len)))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Decodes a chunked body from the front of `buf`.
///
/// Returns the decoded body and the bytes consumed (trailer section
/// included), or `None` if the terminating chunk has not arrived yet.
/// Trailer fields are discarded.
fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ResponseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(ResponseError::InvalidChunk),
        };
        pos += size_len;

        if size == 0 {
            return Ok(trailer_end(&buf[pos..]).map(|len| (body, pos + len)));
        }

        let size = usize::try_from(size).map_err(|_| ResponseError::InvalidChunk)?;
        let end = pos
            .checked_add(size)
            .and_then(|n| n.checked_add(2))
            .ok_or(ResponseError::InvalidChunk)?;
        if buf.len() < end {
            return Ok(None);
        }
        if &buf[end - 2..end] != b"\r\n" {
            return Err(ResponseError::InvalidChunk);
        }

        body.extend_from_slice(&buf[pos..pos + size]);
        pos = end;
    }
}

// Length of the trailer section including its terminating empty line.
fn trailer_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2);
    }
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
