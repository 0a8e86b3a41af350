//! Error types for wire encoding and decoding.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or decoding wire records.
///
/// Every variant describes malformed or oversized input. None of them is
/// transient: retrying the same bytes fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// Deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// Input ended before a complete record or message
    #[error("truncated input: needed {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue
        needed: usize,
        /// Bytes remaining
        available: usize,
    },

    /// Record body does not fit the length prefix
    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge {
        /// Encoded size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Tunnel message exceeds the maximum size
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Encoded size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Unknown record or message kind
    #[error("unknown kind: {0:#04x}")]
    UnknownKind(u8),

    /// Body has bytes left over after decoding
    #[error("trailing bytes after body: {0}")]
    TrailingBytes(usize),
}
