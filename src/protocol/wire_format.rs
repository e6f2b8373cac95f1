//! Wire format constants and control-byte packing.
//!
//! Every logical frame starts with two control bytes:
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────┐
//! │ MSCB                     │ LSCB                     │
//! │ bits 7..2: version       │ bits 7..2: method        │
//! │ bit 1: ID flag           │ bit 1: HEADER flag       │
//! │ bit 0: PATH flag         │ bit 0: BODY flag         │
//! └──────────────────────────┴──────────────────────────┘
//! ```
//!
//! followed by the optional sections the flags announce:
//!
//! ```text
//! MSCB LSCB [ID:2BE] [PATH, ETX] [HDR_COUNT:1] {key, RS, value, ETX}×n [BODY_LEN:1|2|4 BE] [BODY]
//! ```
//!
//! All multi-byte integers are Big Endian. Strings are UTF-8. The width of
//! the BODY_LEN field depends on the method, which is how body capacity
//! scales from 255 bytes (SIGNAL) up to ~4 GiB (STREAMING).

use std::time::Duration;

/// Protocol version emitted by this implementation.
pub const IOT_VERSION: u8 = 1;

/// Highest version the 6-bit MSCB field can carry.
pub const IOT_VERSION_MAX: u8 = 63;

/// Path and header terminator (ASCII End-of-Text).
pub const IOT_ETX: u8 = 0x03;

/// Header key/value separator (ASCII Record Separator).
pub const IOT_RS: u8 = 0x1E;

/// MSCB bit: a 2-byte big-endian request ID follows the control bytes.
pub const IOT_MSCB_ID: u8 = 0x02;

/// MSCB bit: an ETX-terminated UTF-8 path is present.
pub const IOT_MSCB_PATH: u8 = 0x01;

/// LSCB bit: a header section is present.
pub const IOT_LSCB_HEADER: u8 = 0x02;

/// LSCB bit: a BODY_LEN field and body bytes are present.
pub const IOT_LSCB_BODY: u8 = 0x01;

/// Default negotiated buffer size in bytes.
///
/// This caps the size of a single write; larger bodies are fragmented.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default keep-alive interval. Zero disables the keep-alive sub-protocol.
pub const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default request/response timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Inactivity window after which a partial multipart frame is discarded.
pub const MULTIPART_TIMEOUT: Duration = Duration::from_millis(5000);

/// Maximum number of headers a frame may carry (the count is one byte).
pub const MAX_HEADER_COUNT: usize = 255;

/// Bytes reserved for the fixed portion of the prefix when bounding
/// path + headers: `path + encoded_headers <= buffer_size - PREFIX_RESERVE`.
pub const PREFIX_RESERVE: usize = 8;

/// Body length carried by every BUFFER_SIZE_REQUEST / BUFFER_SIZE_RESPONSE.
pub const BUFFER_SIZE_BODY_LEN: usize = 4;

/// Frame methods.
///
/// The numeric values are the 6-bit method field of the LSCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    /// One-shot message, no response expected.
    Signal = 1,
    /// Request expecting a [`Method::Response`].
    Request = 2,
    /// Response to a previously sent request, matched by ID.
    Response = 3,
    /// Request with a large (up to ~4 GiB) body.
    Streaming = 4,
    /// Two-byte liveness probe.
    AliveRequest = 5,
    /// Two-byte liveness answer.
    AliveResponse = 6,
    /// Buffer-size negotiation request (4-byte big-endian body).
    BufferSizeRequest = 7,
    /// Buffer-size negotiation echo.
    BufferSizeResponse = 8,
}

impl Method {
    /// Decode a method from the 6-bit LSCB field.
    ///
    /// Returns `None` for values outside the defined range.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Method::Signal),
            2 => Some(Method::Request),
            3 => Some(Method::Response),
            4 => Some(Method::Streaming),
            5 => Some(Method::AliveRequest),
            6 => Some(Method::AliveResponse),
            7 => Some(Method::BufferSizeRequest),
            8 => Some(Method::BufferSizeResponse),
            _ => None,
        }
    }

    /// Width in bytes of the BODY_LEN field for this method.
    ///
    /// ALIVE frames carry no body and therefore no BODY_LEN field.
    #[inline]
    pub fn body_len_width(self) -> usize {
        match self {
            Method::Signal | Method::BufferSizeRequest | Method::BufferSizeResponse => 1,
            Method::Request | Method::Response => 2,
            Method::Streaming => 4,
            Method::AliveRequest | Method::AliveResponse => 0,
        }
    }

    /// Maximum body length the BODY_LEN field of this method can declare.
    #[inline]
    pub fn max_body_len(self) -> u64 {
        match self.body_len_width() {
            1 => u8::MAX as u64,
            2 => u16::MAX as u64,
            4 => u32::MAX as u64,
            _ => 0,
        }
    }

    /// Whether an ID is allocated automatically when one is not set.
    ///
    /// Only methods that expect a matched response allocate; RESPONSE
    /// carries whatever ID the caller copied from the inbound request, and
    /// SIGNAL carries one only if the caller set it.
    #[inline]
    pub fn allocates_id(self) -> bool {
        matches!(self, Method::Request | Method::Streaming)
    }

    /// Whether this method must travel bare: no ID, path, headers.
    ///
    /// ALIVE_* and BUFFER_SIZE_* exchanges are matched positionally, not by
    /// ID, and never carry addressing metadata.
    #[inline]
    pub fn is_bare(self) -> bool {
        matches!(
            self,
            Method::AliveRequest
                | Method::AliveResponse
                | Method::BufferSizeRequest
                | Method::BufferSizeResponse
        )
    }
}

/// Pack the most significant control byte.
#[inline]
pub fn pack_mscb(version: u8, has_id: bool, has_path: bool) -> u8 {
    let mut byte = version << 2;
    if has_id {
        byte |= IOT_MSCB_ID;
    }
    if has_path {
        byte |= IOT_MSCB_PATH;
    }
    byte
}

/// Pack the least significant control byte.
#[inline]
pub fn pack_lscb(method: Method, has_headers: bool, has_body: bool) -> u8 {
    let mut byte = (method as u8) << 2;
    if has_headers {
        byte |= IOT_LSCB_HEADER;
    }
    if has_body {
        byte |= IOT_LSCB_BODY;
    }
    byte
}

/// Extract the version field from an MSCB.
#[inline]
pub fn mscb_version(mscb: u8) -> u8 {
    mscb >> 2
}

/// Extract the raw method field from an LSCB.
#[inline]
pub fn lscb_method(lscb: u8) -> u8 {
    lscb >> 2
}

/// Check if a flag bit is set in a control byte.
#[inline]
pub fn has_flag(byte: u8, flag: u8) -> bool {
    byte & flag != 0
}

/// Map a negotiated buffer-size body value to the effective size.
///
/// Zero restores the protocol default.
#[inline]
pub fn effective_buffer_size(raw: u32) -> usize {
    if raw == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        raw as usize
    }
}
