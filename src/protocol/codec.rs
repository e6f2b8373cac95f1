//! Frame encoding and parsing.
//!
//! [`encode`] turns a logical [`Request`] into a *prefix* (control bytes
//! through BODY_LEN) plus the body blob; the writer re-carries that prefix
//! on every fragment. [`parse`] reads exactly one frame head from the front
//! of a buffer and reports how many bytes it consumed; body bytes after the
//! head are consumed by the connection, which owns the reassembly state.
//!
//! Parsing is split-point agnostic: a truncated buffer yields
//! [`Parse::NeedMore`] and the caller retries once more bytes arrive.
//! Structural violations (missing terminators, malformed bare frames) yield
//! [`Parse::Violation`]; the caller drops the frame and clears its
//! remainder.

use bytes::Bytes;

use crate::error::{IotError, Result};

use super::request::Request;
use super::wire_format::{
    has_flag, lscb_method, mscb_version, pack_lscb, pack_mscb, Method, BUFFER_SIZE_BODY_LEN,
    IOT_ETX, IOT_LSCB_BODY, IOT_LSCB_HEADER, IOT_MSCB_ID, IOT_MSCB_PATH, IOT_RS,
    IOT_VERSION_MAX, MAX_HEADER_COUNT, PREFIX_RESERVE,
};

/// An encoded frame, ready for the writer.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Control bytes through the BODY_LEN field.
    pub prefix: Vec<u8>,
    /// Body blob, fragmented by the writer as needed.
    pub body: Bytes,
}

impl EncodedFrame {
    /// Total bytes on the wire for a single-fragment send.
    #[inline]
    pub fn len(&self) -> usize {
        self.prefix.len() + self.body.len()
    }

    /// Whether the frame carries no bytes at all (never true in practice).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.body.is_empty()
    }

    /// Concatenated wire bytes of a single-fragment send.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Encoded length of the header section: count byte plus each
/// `key RS value ETX` entry. Zero when there are no headers.
fn encoded_headers_len(headers: &[(String, String)]) -> usize {
    if headers.is_empty() {
        return 0;
    }
    1 + headers
        .iter()
        .map(|(k, v)| k.len() + 1 + v.len() + 1)
        .sum::<usize>()
}

/// Serialize a request into its wire prefix and body.
///
/// Fails fast, without touching any socket, when a precondition is
/// violated: header count over 255, path + headers exceeding
/// `buffer_size - 8`, a body over the method's cap, or metadata on a bare
/// (ALIVE / BUFFER_SIZE) method.
pub fn encode(request: &Request, buffer_size: usize) -> Result<EncodedFrame> {
    if request.version == 0 || request.version > IOT_VERSION_MAX {
        return Err(IotError::Protocol(format!(
            "version {} outside 1..=63",
            request.version
        )));
    }

    let method = request.method;

    if method.is_bare() {
        if request.id.is_some() || request.path.is_some() || !request.headers.is_empty() {
            return Err(IotError::Protocol(format!(
                "{method:?} frames carry no id, path or headers"
            )));
        }
        match method {
            Method::AliveRequest | Method::AliveResponse if !request.body.is_empty() => {
                return Err(IotError::Protocol(format!("{method:?} frames carry no body")));
            }
            Method::BufferSizeRequest | Method::BufferSizeResponse
                if request.body.len() != BUFFER_SIZE_BODY_LEN =>
            {
                return Err(IotError::Protocol(format!(
                    "{method:?} body must be exactly {BUFFER_SIZE_BODY_LEN} bytes"
                )));
            }
            _ => {}
        }
    }

    if request.id == Some(0) {
        return Err(IotError::Protocol("id 0 is reserved".to_string()));
    }

    if request.body.len() as u64 > method.max_body_len() {
        return Err(IotError::BodyTooLarge {
            method,
            got: request.body.len(),
            max: method.max_body_len(),
        });
    }

    if request.headers.len() > MAX_HEADER_COUNT {
        return Err(IotError::TooManyHeaders(request.headers.len()));
    }

    let path_len = request.path.as_ref().map(|p| p.len()).unwrap_or(0);
    let headers_len = encoded_headers_len(&request.headers);
    let limit = buffer_size.saturating_sub(PREFIX_RESERVE);
    if path_len + headers_len > limit {
        return Err(IotError::PrefixTooLarge {
            got: path_len + headers_len,
            limit,
        });
    }

    let has_body = !request.body.is_empty();
    let width = method.body_len_width();

    let mut prefix = Vec::with_capacity(2 + 2 + path_len + 1 + headers_len + width);
    prefix.push(pack_mscb(
        request.version,
        request.id.is_some(),
        request.path.is_some(),
    ));
    prefix.push(pack_lscb(method, !request.headers.is_empty(), has_body));

    if let Some(id) = request.id {
        prefix.extend_from_slice(&id.to_be_bytes());
    }

    if let Some(path) = &request.path {
        prefix.extend_from_slice(path.as_bytes());
        prefix.push(IOT_ETX);
    }

    if !request.headers.is_empty() {
        prefix.push(request.headers.len() as u8);
        for (key, value) in &request.headers {
            prefix.extend_from_slice(key.as_bytes());
            prefix.push(IOT_RS);
            prefix.extend_from_slice(value.as_bytes());
            prefix.push(IOT_ETX);
        }
    }

    if has_body {
        let total = request.body.len() as u64;
        match width {
            1 => prefix.push(total as u8),
            2 => prefix.extend_from_slice(&(total as u16).to_be_bytes()),
            4 => prefix.extend_from_slice(&(total as u32).to_be_bytes()),
            _ => unreachable!("bare methods reject bodies above"),
        }
    }

    Ok(EncodedFrame {
        prefix,
        body: request.body.clone(),
    })
}

/// Outcome of parsing one frame head from the front of a buffer.
#[derive(Debug)]
pub enum Parse {
    /// The buffer ends inside the prefix; retain it and wait for bytes.
    NeedMore,
    /// Structural violation; drop the frame and clear the remainder.
    Violation(&'static str),
    /// A complete frame head.
    Head(ParsedHead),
}

/// A parsed frame head: everything through the BODY_LEN field.
#[derive(Debug, Clone)]
pub struct ParsedHead {
    pub version: u8,
    pub method: Method,
    pub id: Option<u16>,
    pub path: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Value of the BODY_LEN field; zero when the BODY flag is clear.
    pub declared_len: u64,
    /// Bytes consumed by the head, i.e. the offset where body bytes begin.
    pub head_len: usize,
}

impl ParsedHead {
    /// Build the logical request this head describes, with the given body.
    pub fn into_request(self, body: Bytes, parts: u32) -> Request {
        let body_length = body.len();
        Request {
            version: self.version,
            method: self.method,
            id: self.id,
            path: self.path,
            headers: self.headers,
            body,
            body_length,
            total_body_length: self.declared_len,
            parts,
            peer: None,
        }
    }
}

/// Parse one frame head from the front of `buf`.
///
/// `buffer_size` bounds the variable prefix sections: a terminator that has
/// not shown up within `buffer_size - 8` bytes can never arrive (the
/// encoder enforces the same bound), so the frame is a violation rather
/// than a truncation.
pub fn parse(buf: &[u8], buffer_size: usize) -> Parse {
    if buf.len() < 2 {
        return Parse::NeedMore;
    }

    let mscb = buf[0];
    let lscb = buf[1];

    let version = mscb_version(mscb);
    if version == 0 {
        return Parse::Violation("version 0");
    }

    let method = match Method::from_u8(lscb_method(lscb)) {
        Some(m) => m,
        None => return Parse::Violation("unknown method"),
    };

    let has_id = has_flag(mscb, IOT_MSCB_ID);
    let has_path = has_flag(mscb, IOT_MSCB_PATH);
    let has_headers = has_flag(lscb, IOT_LSCB_HEADER);
    let has_body = has_flag(lscb, IOT_LSCB_BODY);

    if method.is_bare() && (has_id || has_path || has_headers) {
        return Parse::Violation("bare method with id/path/headers");
    }
    if matches!(method, Method::AliveRequest | Method::AliveResponse) && has_body {
        return Parse::Violation("alive frame with body");
    }

    let limit = buffer_size.saturating_sub(PREFIX_RESERVE);
    let mut pos = 2usize;

    let id = if has_id {
        if buf.len() < pos + 2 {
            return Parse::NeedMore;
        }
        let id = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        if id == 0 {
            return Parse::Violation("id 0 is reserved");
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    // Bytes of path + header section seen so far, bounded by `limit`.
    let mut variable = 0usize;

    let path = if has_path {
        match scan_terminated(buf, pos, IOT_ETX, limit) {
            Scan::Found(end) => {
                let raw = &buf[pos..end];
                variable += raw.len();
                let path = match std::str::from_utf8(raw) {
                    Ok(s) => s.to_string(),
                    Err(_) => return Parse::Violation("path is not UTF-8"),
                };
                pos = end + 1;
                Some(path)
            }
            Scan::NeedMore => return Parse::NeedMore,
            Scan::Overrun => return Parse::Violation("path terminator missing"),
        }
    } else {
        None
    };

    let mut headers = Vec::new();
    if has_headers {
        if buf.len() < pos + 1 {
            return Parse::NeedMore;
        }
        let count = buf[pos] as usize;
        pos += 1;
        variable += 1;

        for _ in 0..count {
            let budget = limit.saturating_sub(variable);
            let key_end = match scan_terminated(buf, pos, IOT_RS, budget) {
                Scan::Found(end) => end,
                Scan::NeedMore => return Parse::NeedMore,
                Scan::Overrun => return Parse::Violation("header separator missing"),
            };
            variable += key_end - pos + 1;
            let budget = limit.saturating_sub(variable);
            let value_end = match scan_terminated(buf, key_end + 1, IOT_ETX, budget) {
                Scan::Found(end) => end,
                Scan::NeedMore => return Parse::NeedMore,
                Scan::Overrun => return Parse::Violation("header terminator missing"),
            };
            variable += value_end - key_end;

            let key = match std::str::from_utf8(&buf[pos..key_end]) {
                Ok(s) => s.to_string(),
                Err(_) => return Parse::Violation("header key is not UTF-8"),
            };
            let value = match std::str::from_utf8(&buf[key_end + 1..value_end]) {
                Ok(s) => s.to_string(),
                Err(_) => return Parse::Violation("header value is not UTF-8"),
            };
            headers.push((key, value));
            pos = value_end + 1;
        }
    }

    let mut declared_len = 0u64;
    if has_body {
        let width = method.body_len_width();
        if buf.len() < pos + width {
            return Parse::NeedMore;
        }
        declared_len = match width {
            1 => buf[pos] as u64,
            2 => u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64,
            4 => u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as u64,
            _ => unreachable!("alive frames reject the body flag above"),
        };
        pos += width;

        if matches!(
            method,
            Method::BufferSizeRequest | Method::BufferSizeResponse
        ) && declared_len != BUFFER_SIZE_BODY_LEN as u64
        {
            return Parse::Violation("buffer-size body must be 4 bytes");
        }
    }

    Parse::Head(ParsedHead {
        version,
        method,
        id,
        path,
        headers,
        declared_len,
        head_len: pos,
    })
}

enum Scan {
    /// Terminator found at this index.
    Found(usize),
    /// Ran off the buffer while the terminator could still arrive.
    NeedMore,
    /// Scanned past the structural bound; the terminator can never arrive.
    Overrun,
}

/// Scan for `terminator` starting at `start`, allowing at most `budget`
/// bytes before it.
fn scan_terminated(buf: &[u8], start: usize, terminator: u8, budget: usize) -> Scan {
    let hard_end = start.saturating_add(budget).saturating_add(1);
    let window_end = buf.len().min(hard_end);
    if start >= buf.len() {
        return Scan::NeedMore;
    }
    match buf[start..window_end].iter().position(|&b| b == terminator) {
        Some(offset) => Scan::Found(start + offset),
        None if window_end < hard_end => Scan::NeedMore,
        None => Scan::Overrun,
    }
}
