//! Error types for the ratchet engine.

use thiserror::Error;

/// Errors produced by ratchet derivation, encryption and decryption.
///
/// `AuthFailure` is the expected outcome for stale, replayed or forged
/// frames. Callers drop the frame and count it; it is never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// No header key verified the MAC, or the payload failed to decrypt
    #[error("authentication failed")]
    AuthFailure,

    /// The key exchange carried material that was already applied
    #[error("duplicate key exchange")]
    DuplicateKeyExchange,

    /// The remote identity is our own identity
    #[error("key exchange with own identity")]
    SelfKeyExchange,

    /// The header announced a message too far ahead of the receive chain
    #[error("message key gap {gap} exceeds maximum {max}")]
    KeyGapExceeded {
        /// Number of keys that would have to be skipped
        gap: u64,
        /// Configured limit
        max: u32,
    },

    /// The header announced a message behind the receive chain
    #[error("message {requested} is behind receive counter {current}")]
    KeyBehindChain {
        /// Current receive counter
        current: u32,
        /// Counter announced by the header
        requested: u32,
    },

    /// Decrypted header had the wrong length
    #[error("malformed ratchet header: {len} bytes")]
    MalformedHeader {
        /// Length of the decrypted header
        len: usize,
    },

    /// Encryption attempted before the peer's ratchet key is known
    #[error("ratchet not initialized: peer ratchet key unknown")]
    Uninitialized,
}
