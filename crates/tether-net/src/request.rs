//! Request description, typed engine handles and response metadata.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{BridgeError, Result};

/// Opaque application state attached to a request.
///
/// Set when the request starts and handed back, unchanged, to completion
/// handlers and finished listeners. Downcast with
/// [`downcast_ref`](https://doc.rust-lang.org/std/sync/struct.Arc.html).
pub type ClientContext = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a [`ClientContext`].
pub fn client_context<T: Any + Send + Sync>(value: T) -> ClientContext {
    Arc::new(value)
}

/// Identity of one request/response exchange.
///
/// Allocated by the bridge when a request starts and passed to the engine,
/// which uses it in every callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value of this handle.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Identity of one piece of response metadata, allocated by the engine.
///
/// A request that follows redirects sees a different handle per hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResponseInfoHandle(u64);

impl ResponseInfoHandle {
    /// Wrap an engine-assigned identifier.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value of this handle.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResponseInfoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response#{}", self.0)
    }
}

/// A request description handed to the engine on start.
#[derive(Clone, Debug)]
pub struct UrlRequestParams {
    /// Target URL.
    pub url: Url,
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
}

impl UrlRequestParams {
    /// Describe a request with the given method and URL.
    pub fn new(method: Method, url: impl AsRef<str>) -> Result<Self> {
        let url_str = url.as_ref();
        let url = Url::parse(url_str).map_err(|source| BridgeError::InvalidUrl {
            url: url_str.to_string(),
            source,
        })?;
        Ok(Self {
            url,
            method,
            headers: HeaderMap::new(),
        })
    }

    /// Describe a GET request.
    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// Add a header, keeping any existing values for the same name.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| BridgeError::invalid_header(name, err))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|err| BridgeError::invalid_header(name, err))?;
        self.headers.append(header_name, header_value);
        Ok(self)
    }
}

/// Snapshot of response metadata delivered with engine callbacks.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    /// Engine-assigned identity, used to correlate the finished event.
    pub handle: ResponseInfoHandle,
    /// URL this response was received from.
    pub url: String,
    /// URLs visited so far, including this one.
    pub url_chain: Vec<String>,
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Protocol negotiated with the server (e.g. `h2`, `http/1.1`).
    pub negotiated_protocol: String,
}

impl ResponseInfo {
    /// Create response metadata with no headers.
    pub fn new(handle: ResponseInfoHandle, url: impl Into<String>, status: StatusCode) -> Self {
        let url = url.into();
        Self {
            handle,
            url_chain: vec![url.clone()],
            url,
            status,
            headers: HeaderMap::new(),
            negotiated_protocol: "http/1.1".to_string(),
        }
    }

    /// Look up a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A fixed-capacity buffer lent to the engine for one read.
///
/// The engine fills it and hands it back with the read-completed callback;
/// the bridge copies the filled bytes out, clears it and lends it again.
#[derive(Debug)]
pub struct ReadBuffer {
    data: BytesMut,
    capacity: usize,
}

impl ReadBuffer {
    /// Allocate an empty buffer that holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of bytes one read may deliver.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn filled(&self) -> &[u8] {
        &self.data
    }

    /// Space left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Copy as much of `src` as fits; returns the number of bytes copied.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data.extend_from_slice(&src[..n]);
        n
    }

    /// Empty the buffer for reuse.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
