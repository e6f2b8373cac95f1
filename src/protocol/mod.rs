//! Protocol module - wire format, frame codec, and the logical frame type.
//!
//! This module owns the binary format:
//! - control-byte packing and protocol constants
//! - the [`Request`] logical frame with typed accessors
//! - prefix/body encoding and split-point-agnostic parsing

pub mod codec;
mod request;
mod wire_format;

pub use request::Request;
pub use wire_format::{
    effective_buffer_size, has_flag, lscb_method, mscb_version, pack_lscb, pack_mscb, Method,
    BUFFER_SIZE_BODY_LEN, DEFAULT_ALIVE_INTERVAL, DEFAULT_BUFFER_SIZE, DEFAULT_RESPONSE_TIMEOUT,
    IOT_ETX, IOT_LSCB_BODY, IOT_LSCB_HEADER, IOT_MSCB_ID, IOT_MSCB_PATH, IOT_RS, IOT_VERSION,
    IOT_VERSION_MAX, MAX_HEADER_COUNT, MULTIPART_TIMEOUT, PREFIX_RESERVE,
};
