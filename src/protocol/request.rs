//! Logical frame type with typed accessors.
//!
//! A [`Request`] is one logical frame regardless of how many wire fragments
//! carried it. Payloads use `bytes::Bytes` for cheap sharing between the
//! reassembly engine, pending-response callbacks, and middleware.
//!
//! # Example
//!
//! ```
//! use iotwire::{Method, Request};
//!
//! let req = Request::new(Method::Request)
//!     .with_path("/sensors/thermo")
//!     .with_header("unit", "celsius")
//!     .with_body(b"21.5".as_ref());
//!
//! assert_eq!(req.path(), Some("/sensors/thermo"));
//! assert_eq!(req.header("unit"), Some("celsius"));
//! ```

use std::net::SocketAddr;

use bytes::Bytes;

use super::wire_format::{Method, IOT_VERSION};

/// A logical protocol frame.
///
/// Headers are an ordered list rather than a map so that a decode/encode
/// round trip reproduces the source bytes exactly.
#[derive(Debug, Clone)]
pub struct Request {
    /// Protocol version, 1..=63.
    pub version: u8,
    /// Frame method.
    pub method: Method,
    /// Request ID; present iff the MSCB ID flag is set on the wire.
    pub id: Option<u16>,
    /// UTF-8 path, ETX-terminated on the wire.
    pub path: Option<String>,
    /// Ordered, case-sensitive header pairs. At most 255.
    pub headers: Vec<(String, String)>,
    /// Body bytes delivered so far (the full body once complete).
    pub body: Bytes,
    /// Body bytes delivered by the current fragment.
    pub body_length: usize,
    /// Authoritative body length declared by the first fragment.
    pub total_body_length: u64,
    /// Writes used on send; fragments reassembled on receive.
    pub parts: u32,
    /// Peer address of the owning connection. Non-owning; resolve the live
    /// connection through the engine registry.
    pub peer: Option<SocketAddr>,
}

impl Request {
    /// Create an empty frame for the given method.
    pub fn new(method: Method) -> Self {
        Self {
            version: IOT_VERSION,
            method,
            id: None,
            path: None,
            headers: Vec::new(),
            body: Bytes::new(),
            body_length: 0,
            total_body_length: 0,
            parts: 0,
            peer: None,
        }
    }

    /// Set the request ID.
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Append a header pair. Order is preserved on the wire.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.body_length = self.body.len();
        self.total_body_length = self.body.len() as u64;
        self
    }

    /// Build a RESPONSE frame answering this request.
    ///
    /// Copies the ID so the peer's pending table can match it; everything
    /// else starts empty.
    pub fn reply(&self) -> Request {
        let mut response = Request::new(Method::Response);
        response.id = self.id;
        response.peer = self.peer;
        response
    }

    /// Look up a header value by key (first match, case-sensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the path, if any.
    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether every declared body byte has been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.body.len() as u64 >= self.total_body_length
    }

    /// Whether this frame carries an ID on the wire.
    #[inline]
    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
}
