//! CADET Ratchet Engine
//!
//! Cryptographic core of a CADET tunnel: key agreement, the double ratchet
//! with encrypted headers, and skipped-key bookkeeping. Pure functions and
//! state; no clock and no entropy source. Callers provide random bytes and
//! tell the ratchet when its time threshold has passed, which keeps every
//! operation deterministic under test.
//!
//! # Key Lifecycle
//!
//! ```text
//! identity keys + ephemeral keys (key exchange)
//!        │
//!        ▼
//! 3x ECDH → HKDF → root key, header keys, first chain key
//!        │
//!        ├──▶ chain key ─HMAC("0")─▶ message key (one use)
//!        │        └────HMAC("1")─▶ next chain key
//!        │
//!        └──▶ DH ratchet step (every N messages or T time)
//!                 new ratchet key → new root, header and chain keys
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are replaced after every message
//! - Message keys are used for exactly one frame
//! - DH ratchet steps mix fresh agreements into the root key
//!
//! Authenticity:
//! - Every frame carries an HMAC under a key bound to the header key
//! - The MAC is verified before any decryption is attempted
//! - Headers and payloads are XChaCha20-Poly1305 encrypted
//!
//! Replay:
//! - Skipped keys are removed on use; a replayed frame finds no key
//! - The skipped-key store is capped in size and in counter gap

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod header;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod skipped;

pub use error::RatchetError;
pub use header::{HEADER_SIZE, RatchetHeader};
pub use kdf::port_hash;
pub use keys::{IdentityKeyPair, KEY_SIZE, Role, SymmetricKey};
pub use ratchet::{
    HEADER_NONCE_SIZE, KeyPath, Opened, RatchetConfig, RatchetState, SealEntropy, Sealed,
    SealedMessage,
};
pub use skipped::{SkippedKey, SkippedKeys};
