//! HTTP header map with case-insensitive name lookup.
//!
//! Field order and duplicate fields are preserved so that a response can be
//! written to the cache and read back without losing multi-value headers
//! such as `Set-Cookie` (RFC 9110 §5.3).

use std::fmt;

use bytes::Bytes;

/// A case-insensitive, multi-value HTTP header map.
///
/// Values are kept as raw bytes. Field values may carry obs-text (bytes
/// 0x80-0xFF, e.g. Latin-1 filenames), and those must reach the cache and the
/// client unchanged. [`get`](Self::get) and [`get_all`](Self::get_all) are
/// the text views and skip values that are not valid UTF-8;
/// [`get_bytes`](Self::get_bytes) and [`iter`](Self::iter) see every value.
///
/// # Examples
///
/// ```
/// use apiproxy::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("Set-Cookie", "b=2");
/// headers.set("Content-Type", "text/plain");
/// headers.set("content-type", "application/json");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
/// let cookies: Vec<_> = headers.get_all("set-cookie").collect();
/// assert_eq!(cookies, vec!["a=1", "b=2"]);
///
/// headers.insert("Content-Disposition", &b"attachment; filename=\"caf\xe9\""[..]);
/// assert_eq!(headers.get("content-disposition"), None);
/// assert!(headers.get_bytes("content-disposition").unwrap().ends_with(b"caf\xe9\""));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, Bytes)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with room for `capacity` fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field. Existing fields with the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        self.inner
            .push((name.into(), Bytes::copy_from_slice(value.as_ref())));
    }

    /// Replaces every field named `name` with a single field.
    ///
    /// The new field takes the position of the first replaced one, or is
    /// appended if the name was absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        let name = name.into();
        let value = Bytes::copy_from_slice(value.as_ref());
        match self
            .inner
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                let mut index = 0;
                self.inner.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
                self.inner[pos] = (name, value);
            }
            None => self.inner.push((name, value)),
        }
    }

    /// Returns the first value for `name` as text, or `None` if it is absent
    /// or not valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Returns the raw bytes of the first value for `name`.
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Returns all UTF-8 values for `name` in field order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Removes all fields named `name`. Returns `true` if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if at least one field is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns `true` if any comma-separated element of any `name` field
    /// equals `token` (ASCII case-insensitive), e.g. `chunked` in
    /// `Transfer-Encoding: gzip, chunked`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Number of fields (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns all `(name, value)` pairs in field order, values as raw bytes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Appends every field to `buf` as `name: value\r\n` lines, byte for byte,
    /// skipping names for which `skip` returns `true`.
    pub(crate) fn write_to(&self, buf: &mut bytes::BytesMut, skip: impl Fn(&str) -> bool) {
        use bytes::BufMut;

        for (name, value) in self.iter().filter(|&(name, _)| !skip(name)) {
            buf.put(name.as_bytes());
            buf.put(&b": "[..]);
            buf.put(value);
            buf.put(&b"\r\n"[..]);
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {}\r\n", String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}
