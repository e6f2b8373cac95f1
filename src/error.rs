//! Error types for iotwire.

use thiserror::Error;

use crate::protocol::Method;

/// Main error type for all protocol operations.
#[derive(Debug, Error)]
pub enum IotError {
    /// I/O error from the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation (malformed frame, invalid field, wrong flags).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// More headers than the one-byte count field can carry.
    #[error("header count {0} exceeds 255")]
    TooManyHeaders(usize),

    /// Path plus encoded headers exceed the negotiated buffer budget.
    #[error("path and headers take {got} bytes, limit is {limit}")]
    PrefixTooLarge { got: usize, limit: usize },

    /// Body larger than the method's length field can declare.
    #[error("{method:?} body of {got} bytes exceeds the {max} byte cap")]
    BodyTooLarge { method: Method, got: usize, max: u64 },

    /// The negotiated buffer cannot hold even the frame prefix.
    #[error("buffer size {0} cannot hold the frame prefix")]
    BufferTooSmall(usize),

    /// Connection closed or destroyed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using [`IotError`].
pub type Result<T> = std::result::Result<T, IotError>;
