//! Key material types.
//!
//! Symmetric keys zeroize on drop. Asymmetric keys are x25519 key pairs; a
//! peer's long-term identity is its x25519 public key.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Size of every symmetric key in the ratchet (root, chain, header, message).
pub const KEY_SIZE: usize = 32;

/// A 32-byte symmetric key.
///
/// Used for root, chain, header and message keys alike. The bytes are
/// overwritten when the key is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// All-zero key. Placeholder until a key exchange fills the slot.
    pub fn zero() -> Self {
        Self([0u8; KEY_SIZE])
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Long-term identity key pair of the local peer.
///
/// The public half doubles as the peer identity on the wire.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Build an identity from 32 caller-provided random bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public identity key.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Public identity key bytes.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Which key assignment a peer takes after a key exchange.
///
/// The peer with the smaller identity is the initiator: it sends the key
/// exchange and performs the first ratchet step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Smaller identity. Sends `KeyExchange`.
    Initiator,
    /// Larger identity. Answers with `KeyExchangeAuth`.
    Responder,
}

impl Role {
    /// Determine our role from the two identities.
    ///
    /// Returns `None` when both identities are equal.
    pub fn from_identities(local: &[u8; KEY_SIZE], remote: &[u8; KEY_SIZE]) -> Option<Self> {
        match local.cmp(remote) {
            std::cmp::Ordering::Less => Some(Self::Initiator),
            std::cmp::Ordering::Greater => Some(Self::Responder),
            std::cmp::Ordering::Equal => None,
        }
    }
}
