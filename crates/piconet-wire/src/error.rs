//! Errors from the wire protocol layer.

use thiserror::Error;

/// A payload that is not one of the two PicoNet envelope shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,
    #[error("Truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Element is not valid UTF-8")]
    InvalidUtf8,
    #[error("Unexpected element count: {0}")]
    Arity(usize),
    #[error("Unknown handshake marker: {0:?}")]
    UnknownMarker(String),
    #[error("{0} trailing bytes after last element")]
    TrailingBytes(usize),
}

/// Errors from codecs, framing and transports.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Application id mismatch: expected {expected:?}, got {actual:?}")]
    IdentityMismatch { expected: String, actual: String },
    #[error("Unexpected envelope: {0}")]
    UnexpectedEnvelope(&'static str),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Timed out: {0}")]
    Timeout(&'static str),
    #[error("Transport not started")]
    NotStarted,
}
