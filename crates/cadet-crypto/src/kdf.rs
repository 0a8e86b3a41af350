//! Key derivation helpers.
//!
//! Chain advancement and message keys use HMAC-SHA256 with single-byte
//! labels. Multi-key expansion after a Diffie-Hellman exchange uses
//! HKDF-SHA256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::keys::{KEY_SIZE, SymmetricKey};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a message key from a chain key
const MESSAGE_LABEL: &[u8] = b"0";

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"1";

/// Label for deriving a MAC key from a header key
const AUTH_LABEL: &[u8] = b"cadet header auth";

/// Salt for the initial key exchange expansion
pub(crate) const KX_SALT: &[u8] = b"CADET Axolotl salt";

/// Salt for every subsequent DH ratchet step
pub(crate) const RATCHET_SALT: &[u8] = b"axolotl ratchet";

/// Info string for HKDF expansion
const EXPAND_INFO: &[u8] = b"cadet ratchet keys";

/// Label for port hashing
const PORT_LABEL: &[u8] = b"cadet port";

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_hash(key: &[u8], data: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an HMAC-SHA256 tag.
pub fn hmac_verify(key: &[u8], data: &[&[u8]], tag: &[u8; 32]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    for part in data {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// HMAC-SHA256 over several slices, in order.
pub fn hmac_parts(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    for part in data {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Message key for the current chain position.
pub fn message_key(chain_key: &SymmetricKey) -> SymmetricKey {
    SymmetricKey::from_bytes(hmac_hash(chain_key.as_bytes(), MESSAGE_LABEL))
}

/// Next chain key.
pub fn next_chain_key(chain_key: &SymmetricKey) -> SymmetricKey {
    SymmetricKey::from_bytes(hmac_hash(chain_key.as_bytes(), CHAIN_LABEL))
}

/// MAC key bound to a header key.
pub fn auth_key(header_key: &SymmetricKey) -> SymmetricKey {
    SymmetricKey::from_bytes(hmac_hash(header_key.as_bytes(), AUTH_LABEL))
}

/// SHA-256 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Port identifier as seen on the wire: `H(label || port || listener)`.
///
/// Binding the listener's identity means the same port name on two peers
/// never collides.
pub fn port_hash(port: &[u8], listener: &[u8; KEY_SIZE]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(PORT_LABEL);
    hasher.update(port);
    hasher.update(listener);
    hasher.finalize().into()
}

/// Expand input key material into `N` symmetric keys.
pub fn expand<const N: usize>(salt: &[u8], ikm: &[u8]) -> [SymmetricKey; N] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);

    std::array::from_fn(|i| {
        let mut info = Vec::with_capacity(EXPAND_INFO.len() + 1);
        info.extend_from_slice(EXPAND_INFO);
        info.push(i as u8);

        let mut okm = [0u8; KEY_SIZE];
        let Ok(()) = hkdf.expand(&info, &mut okm) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        SymmetricKey::from_bytes(okm)
    })
}
