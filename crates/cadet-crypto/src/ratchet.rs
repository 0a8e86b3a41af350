//! Double ratchet with encrypted headers.
//!
//! One [`RatchetState`] holds the key material of one tunnel in both
//! directions. Keys evolve three ways:
//!
//! - Key exchange: three x25519 agreements (static-static, static-ephemeral,
//!   ephemeral-ephemeral) are expanded into the root key and the first
//!   header and chain keys.
//! - Symmetric ratchet: every message advances the chain key of its
//!   direction; the message key is used once.
//! - DH ratchet: after enough messages or time the sender picks a new
//!   ratchet key and mixes a fresh agreement into the root key. The receiver
//!   notices the step because the frame verifies under its *next* header key.
//!
//! ```text
//!            ss || se || ee
//!                  │
//!       HKDF("CADET Axolotl salt")
//!                  │
//!   ┌──────┬───────┼───────┬───────┐
//!   RK    HK      NHK     NHK'     CK        (assignment depends on role)
//!   │
//!   ├─ HMAC(RK, DH(DHRs, DHRr)) ─ HKDF("axolotl ratchet") ─▶ RK', NHK, CK
//! ```
//!
//! # Frame layout
//!
//! `header_nonce || E(HK, header) || E(MK, payload) || HMAC(auth(HK), ...)`.
//! The MAC covers the nonce, the encrypted header and the ciphertext and is
//! checked before anything is decrypted.

use std::time::Duration;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::RatchetError,
    header::RatchetHeader,
    kdf,
    keys::{IdentityKeyPair, Role, SymmetricKey},
    skipped::{SkippedKey, SkippedKeys},
};

/// Size of the random header nonce carried with every frame.
pub const HEADER_NONCE_SIZE: usize = 24;

/// Message keys are single-use, so the payload AEAD can use a fixed nonce.
const PAYLOAD_NONCE: [u8; 24] = [0u8; 24];

/// Default number of messages after which the sender steps the DH ratchet.
pub const DEFAULT_RATCHET_MESSAGES: u32 = 64;

/// Default time after which the sender steps the DH ratchet.
pub const DEFAULT_RATCHET_TIME: Duration = Duration::from_secs(60 * 60);

/// Default cap on stored skipped message keys.
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 64;

/// Default cap on how far ahead of the receive chain a header may point.
pub const DEFAULT_MAX_KEY_GAP: u32 = 256;

/// Ratchet thresholds.
///
/// The numbers are operational tuning, not correctness parameters: any
/// positive values produce a working ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Messages sent before a DH ratchet step is requested
    pub ratchet_messages: u32,
    /// Time since the last step before a DH ratchet step is requested
    pub ratchet_time: Duration,
    /// Maximum number of stored skipped keys
    pub max_skipped_keys: usize,
    /// Maximum gap between the receive counter and a header counter
    pub max_key_gap: u32,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            ratchet_messages: DEFAULT_RATCHET_MESSAGES,
            ratchet_time: DEFAULT_RATCHET_TIME,
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            max_key_gap: DEFAULT_MAX_KEY_GAP,
        }
    }
}

/// Caller-provided randomness for one [`RatchetState::encrypt`] call.
///
/// `ratchet_secret` is consumed only when the call performs a DH step.
pub struct SealEntropy {
    /// Secret for a new ratchet key pair
    pub ratchet_secret: [u8; 32],
    /// Nonce for header encryption
    pub header_nonce: [u8; HEADER_NONCE_SIZE],
}

impl Drop for SealEntropy {
    fn drop(&mut self) {
        self.ratchet_secret.zeroize();
    }
}

/// An encrypted, authenticated frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Random nonce used for the header encryption
    pub header_nonce: [u8; HEADER_NONCE_SIZE],
    /// Encrypted [`RatchetHeader`] including its Poly1305 tag
    pub header: Vec<u8>,
    /// Encrypted payload including its Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// HMAC over nonce, encrypted header and ciphertext
    pub mac: [u8; 32],
}

/// Result of [`RatchetState::encrypt`].
#[derive(Debug, Clone)]
pub struct Sealed {
    /// The frame body to transmit
    pub message: SealedMessage,
    /// Whether this call performed a DH ratchet step
    pub ratchet_stepped: bool,
}

/// Which key opened a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPath {
    /// Current receiving header key
    Current,
    /// Next receiving header key; a DH ratchet step was performed
    NextHeaderKey,
    /// A stored skipped key
    Skipped,
}

/// Result of [`RatchetState::decrypt`].
#[derive(Debug, Clone)]
pub struct Opened {
    /// Decrypted payload
    pub plaintext: Vec<u8>,
    /// Which key path succeeded
    pub path: KeyPath,
}

/// Cryptographic state of one tunnel.
///
/// Created with fresh ephemeral and ratchet keys, then completed by
/// [`derive_from_handshake`](Self::derive_from_handshake) once the peer's
/// key exchange arrives.
#[derive(Clone)]
pub struct RatchetState {
    role: Role,
    /// Ephemeral key announced in our key exchange
    kx_secret: StaticSecret,
    /// Our current ratchet key (DHRs)
    ratchet_secret: StaticSecret,
    /// Peer's current ratchet key (DHRr)
    peer_ratchet: Option<PublicKey>,
    /// Peer's last applied ephemeral key
    peer_ephemeral: Option<PublicKey>,

    root_key: SymmetricKey,
    header_send: SymmetricKey,
    header_recv: Option<SymmetricKey>,
    next_header_send: SymmetricKey,
    next_header_recv: SymmetricKey,
    chain_send: SymmetricKey,
    chain_recv: SymmetricKey,

    /// Next message number on the sending chain
    ns: u32,
    /// Next expected message number on the receiving chain
    nr: u32,
    /// Length of the previous sending chain
    pns: u32,

    /// A DH step is due on the next encryption
    ratchet_pending: bool,
    /// Peer has shown it holds our last ratchet key
    ratchet_allowed: bool,
    /// Messages sent since the last DH step
    ratchet_counter: u32,

    skipped: SkippedKeys,
    config: RatchetConfig,
}

impl RatchetState {
    /// Create a state with fresh ephemeral and ratchet keys.
    ///
    /// # Errors
    ///
    /// - `SelfKeyExchange` if `remote_identity` is our own identity
    pub fn new(
        local: &IdentityKeyPair,
        remote_identity: &[u8; 32],
        kx_secret: [u8; 32],
        ratchet_secret: [u8; 32],
        config: RatchetConfig,
    ) -> Result<Self, RatchetError> {
        let role = Role::from_identities(&local.public_bytes(), remote_identity)
            .ok_or(RatchetError::SelfKeyExchange)?;

        Ok(Self {
            role,
            kx_secret: StaticSecret::from(kx_secret),
            ratchet_secret: StaticSecret::from(ratchet_secret),
            peer_ratchet: None,
            peer_ephemeral: None,
            root_key: SymmetricKey::zero(),
            header_send: SymmetricKey::zero(),
            header_recv: None,
            next_header_send: SymmetricKey::zero(),
            next_header_recv: SymmetricKey::zero(),
            chain_send: SymmetricKey::zero(),
            chain_recv: SymmetricKey::zero(),
            ns: 0,
            nr: 0,
            pns: 0,
            ratchet_pending: false,
            ratchet_allowed: false,
            ratchet_counter: 0,
            skipped: SkippedKeys::new(config.max_skipped_keys),
            config,
        })
    }

    /// Start a parallel state for a re-key proposal.
    ///
    /// Keeps our ephemeral and ratchet keys, the root key and the peer's
    /// ratchet key; everything derived from them starts over.
    pub fn fork(&self) -> Self {
        Self {
            role: self.role,
            kx_secret: self.kx_secret.clone(),
            ratchet_secret: self.ratchet_secret.clone(),
            peer_ratchet: self.peer_ratchet,
            peer_ephemeral: self.peer_ephemeral,
            root_key: self.root_key.clone(),
            header_send: SymmetricKey::zero(),
            header_recv: None,
            next_header_send: SymmetricKey::zero(),
            next_header_recv: SymmetricKey::zero(),
            chain_send: SymmetricKey::zero(),
            chain_recv: SymmetricKey::zero(),
            ns: 0,
            nr: 0,
            pns: 0,
            ratchet_pending: false,
            ratchet_allowed: false,
            ratchet_counter: 0,
            skipped: SkippedKeys::new(self.config.max_skipped_keys),
            config: self.config.clone(),
        }
    }

    /// Our role in this tunnel.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Public half of the ephemeral key announced in key exchanges.
    pub fn ephemeral_public(&self) -> [u8; 32] {
        PublicKey::from(&self.kx_secret).to_bytes()
    }

    /// Public half of our current ratchet key.
    pub fn ratchet_public(&self) -> [u8; 32] {
        PublicKey::from(&self.ratchet_secret).to_bytes()
    }

    /// Whether a key exchange has been applied.
    pub fn is_initialized(&self) -> bool {
        self.peer_ratchet.is_some()
    }

    /// Digest of the root key, sent in `KeyExchangeAuth` to prove agreement.
    pub fn root_key_digest(&self) -> [u8; 32] {
        kdf::hash(self.root_key.as_bytes())
    }

    /// Whether `ephemeral` is the peer ephemeral of the last applied exchange.
    ///
    /// The peer's ratchet key moves on with every DH step, but its ephemeral
    /// only changes when it starts a new exchange.
    pub fn matches_ephemeral(&self, ephemeral: &[u8; 32]) -> bool {
        self.peer_ephemeral.is_some_and(|peer| peer.as_bytes() == ephemeral)
    }

    /// Number of stored skipped keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Chain positions of stored skipped keys, newest first.
    pub fn skipped_counters(&self) -> Vec<u32> {
        self.skipped.counters().collect()
    }

    /// Next message number on the sending chain.
    pub fn send_counter(&self) -> u32 {
        self.ns
    }

    /// Next expected message number on the receiving chain.
    pub fn recv_counter(&self) -> u32 {
        self.nr
    }

    /// Ratchet thresholds in effect.
    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Apply the peer's key exchange.
    ///
    /// Combines static-static, static-ephemeral and ephemeral-ephemeral
    /// agreements into five keys and assigns them by role.
    ///
    /// # Errors
    ///
    /// - `SelfKeyExchange` if the peer identity is ours
    /// - `DuplicateKeyExchange` if the ratchet key is already known or the
    ///   derived root key is unchanged; the state is left untouched
    pub fn derive_from_handshake(
        &mut self,
        local: &IdentityKeyPair,
        remote_identity: &[u8; 32],
        remote_ephemeral: &[u8; 32],
        remote_ratchet: &[u8; 32],
    ) -> Result<(), RatchetError> {
        let role = Role::from_identities(&local.public_bytes(), remote_identity)
            .ok_or(RatchetError::SelfKeyExchange)?;

        let remote_ratchet = PublicKey::from(*remote_ratchet);
        if self.peer_ratchet == Some(remote_ratchet) {
            return Err(RatchetError::DuplicateKeyExchange);
        }

        let remote_identity = PublicKey::from(*remote_identity);
        let remote_ephemeral = PublicKey::from(*remote_ephemeral);

        let ss = local.secret().diffie_hellman(&remote_identity);
        let se = match role {
            Role::Initiator => local.secret().diffie_hellman(&remote_ephemeral),
            Role::Responder => self.kx_secret.diffie_hellman(&remote_identity),
        };
        let ee = self.kx_secret.diffie_hellman(&remote_ephemeral);

        let mut ikm = [0u8; 96];
        ikm[0..32].copy_from_slice(ss.as_bytes());
        ikm[32..64].copy_from_slice(se.as_bytes());
        ikm[64..96].copy_from_slice(ee.as_bytes());
        let [root, k1, k2, k3, k4] = kdf::expand::<5>(kdf::KX_SALT, &ikm);
        ikm.zeroize();

        if root == self.root_key {
            return Err(RatchetError::DuplicateKeyExchange);
        }

        self.role = role;
        self.peer_ratchet = Some(remote_ratchet);
        self.peer_ephemeral = Some(remote_ephemeral);
        self.root_key = root;
        self.ns = 0;
        self.nr = 0;
        self.pns = 0;
        self.ratchet_counter = 0;

        match role {
            Role::Initiator => {
                self.header_recv = Some(k1);
                self.next_header_send = k2;
                self.next_header_recv = k3;
                self.chain_recv = k4;
                self.ratchet_pending = true;
            },
            Role::Responder => {
                self.header_send = k1;
                self.next_header_recv = k2;
                self.next_header_send = k3;
                self.chain_send = k4;
                self.ratchet_pending = false;
            },
        }

        Ok(())
    }

    /// Encrypt one payload.
    ///
    /// `step_due` tells the state that the ratchet time threshold has passed;
    /// the caller owns the clock. A DH step is performed when one is pending,
    /// or when the message or time threshold is reached and the peer has
    /// confirmed our previous ratchet key.
    ///
    /// # Errors
    ///
    /// - `Uninitialized` if no key exchange has been applied
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        entropy: &SealEntropy,
        step_due: bool,
    ) -> Result<Sealed, RatchetError> {
        let Some(peer_ratchet) = self.peer_ratchet else {
            return Err(RatchetError::Uninitialized);
        };

        self.ratchet_counter = self.ratchet_counter.saturating_add(1);
        if self.ratchet_allowed
            && (self.ratchet_counter >= self.config.ratchet_messages || step_due)
        {
            self.ratchet_pending = true;
        }

        let ratchet_stepped = self.ratchet_pending;
        if ratchet_stepped {
            self.step_sending(&peer_ratchet, entropy.ratchet_secret);
        }

        let message_key = kdf::message_key(&self.chain_send);
        self.chain_send = kdf::next_chain_key(&self.chain_send);
        let ciphertext = seal(&message_key, &PAYLOAD_NONCE, plaintext);

        let header = RatchetHeader { ns: self.ns, pns: self.pns, dhr: self.ratchet_public() };
        self.ns = self.ns.wrapping_add(1);
        let encrypted_header = seal(&self.header_send, &entropy.header_nonce, &header.to_bytes());

        let auth = kdf::auth_key(&self.header_send);
        let mac = kdf::hmac_parts(
            auth.as_bytes(),
            &[&entropy.header_nonce, &encrypted_header, &ciphertext],
        );

        Ok(Sealed {
            message: SealedMessage {
                header_nonce: entropy.header_nonce,
                header: encrypted_header,
                ciphertext,
                mac,
            },
            ratchet_stepped,
        })
    }

    /// Decrypt one frame.
    ///
    /// Tries the current receiving header key, then the next one (performing
    /// a DH step on success), then the skipped-key store. The state only
    /// changes when decryption succeeds.
    ///
    /// # Errors
    ///
    /// - `AuthFailure` if no key opens the frame
    pub fn decrypt(&mut self, message: &SealedMessage) -> Result<Opened, RatchetError> {
        let mut next = self.clone();
        let opened = next.open(message)?;
        *self = next;
        Ok(opened)
    }

    /// Decrypt using only the skipped-key store.
    ///
    /// A matching key is removed; each key opens at most one frame.
    ///
    /// # Errors
    ///
    /// - `AuthFailure` if no stored key opens the frame
    pub fn try_skipped_keys(&mut self, message: &SealedMessage) -> Result<Opened, RatchetError> {
        let mut next = self.clone();
        let opened = next.open_skipped(message)?;
        *self = next;
        Ok(opened)
    }

    fn open(&mut self, message: &SealedMessage) -> Result<Opened, RatchetError> {
        if !self.is_initialized() {
            return Err(RatchetError::AuthFailure);
        }

        let current = self.header_recv.as_ref().and_then(|hk| open_header(hk, message));

        let (header, path) = if let Some(header) = current {
            if header.ns != self.nr {
                let Some(hk) = self.header_recv.clone() else {
                    return Err(RatchetError::AuthFailure);
                };
                if self.store_keys(&hk, header.ns).is_err() {
                    return self.open_skipped(message);
                }
            }
            (header, KeyPath::Current)
        } else if let Some(header) = open_header(&self.next_header_recv, message) {
            let old_header_key = self.header_recv.replace(self.next_header_recv.clone());
            if let Some(old) = old_header_key {
                if let Err(error) = self.store_keys(&old, header.pns) {
                    debug!(%error, previous = header.pns, "keys of the previous chain lost");
                }
            }
            self.step_receiving(PublicKey::from(header.dhr));

            if header.ns != self.nr {
                let Some(hk) = self.header_recv.clone() else {
                    return Err(RatchetError::AuthFailure);
                };
                self.store_keys(&hk, header.ns)?;
            }
            (header, KeyPath::NextHeaderKey)
        } else {
            return self.open_skipped(message);
        };

        let message_key = kdf::message_key(&self.chain_recv);
        self.chain_recv = kdf::next_chain_key(&self.chain_recv);
        self.nr = header.ns.wrapping_add(1);

        let plaintext = open(&message_key, &PAYLOAD_NONCE, &message.ciphertext)
            .ok_or(RatchetError::AuthFailure)?;
        Ok(Opened { plaintext, path })
    }

    fn open_skipped(&mut self, message: &SealedMessage) -> Result<Opened, RatchetError> {
        for header_key in self.skipped.header_keys() {
            let Some(header) = open_header(&header_key, message) else {
                continue;
            };
            let entry =
                self.skipped.take(&header_key, header.ns).ok_or(RatchetError::AuthFailure)?;
            let plaintext = open(&entry.message_key, &PAYLOAD_NONCE, &message.ciphertext)
                .ok_or(RatchetError::AuthFailure)?;
            return Ok(Opened { plaintext, path: KeyPath::Skipped });
        }
        Err(RatchetError::AuthFailure)
    }

    /// Derive and store message keys of the receive chain up to `target`.
    fn store_keys(&mut self, header_key: &SymmetricKey, target: u32) -> Result<(), RatchetError> {
        if target < self.nr {
            return Err(RatchetError::KeyBehindChain { current: self.nr, requested: target });
        }
        let gap = u64::from(target - self.nr);
        if gap > u64::from(self.config.max_key_gap) {
            return Err(RatchetError::KeyGapExceeded { gap, max: self.config.max_key_gap });
        }

        while self.nr < target {
            let message_key = kdf::message_key(&self.chain_recv);
            self.chain_recv = kdf::next_chain_key(&self.chain_recv);
            self.skipped.insert(SkippedKey {
                header_key: header_key.clone(),
                message_key,
                counter: self.nr,
            });
            self.nr += 1;
        }
        Ok(())
    }

    fn step_sending(&mut self, peer_ratchet: &PublicKey, secret: [u8; 32]) {
        self.ratchet_secret = StaticSecret::from(secret);
        self.header_send = self.next_header_send.clone();

        let dh = self.ratchet_secret.diffie_hellman(peer_ratchet);
        let mixed = kdf::hmac_hash(self.root_key.as_bytes(), dh.as_bytes());
        let [root, next_header, chain] = kdf::expand::<3>(kdf::RATCHET_SALT, &mixed);

        self.root_key = root;
        self.next_header_send = next_header;
        self.chain_send = chain;
        self.pns = self.ns;
        self.ns = 0;
        self.ratchet_pending = false;
        self.ratchet_allowed = false;
        self.ratchet_counter = 0;
    }

    fn step_receiving(&mut self, peer_ratchet: PublicKey) {
        let dh = self.ratchet_secret.diffie_hellman(&peer_ratchet);
        let mixed = kdf::hmac_hash(self.root_key.as_bytes(), dh.as_bytes());
        let [root, next_header, chain] = kdf::expand::<3>(kdf::RATCHET_SALT, &mixed);

        self.root_key = root;
        self.next_header_recv = next_header;
        self.chain_recv = chain;
        self.peer_ratchet = Some(peer_ratchet);
        self.nr = 0;
        self.ratchet_allowed = true;
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("role", &self.role)
            .field("initialized", &self.is_initialized())
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pns", &self.pns)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

/// Verify the MAC under `header_key` and decrypt the header.
fn open_header(header_key: &SymmetricKey, message: &SealedMessage) -> Option<RatchetHeader> {
    let auth = kdf::auth_key(header_key);
    if !kdf::hmac_verify(
        auth.as_bytes(),
        &[&message.header_nonce, &message.header, &message.ciphertext],
        &message.mac,
    ) {
        return None;
    }
    let bytes = open(header_key, &message.header_nonce, &message.header)?;
    RatchetHeader::from_bytes(&bytes).ok()
}

fn seal(key: &SymmetricKey, nonce: &[u8; 24], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

fn open(key: &SymmetricKey, nonce: &[u8; 24], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        alice: RatchetState,
        bob: RatchetState,
        counter: u8,
    }

    impl Pair {
        fn entropy(&mut self) -> SealEntropy {
            self.counter = self.counter.wrapping_add(1);
            SealEntropy {
                ratchet_secret: [self.counter; 32],
                header_nonce: [self.counter.wrapping_mul(3); 24],
            }
        }

        fn alice_seal(&mut self, plaintext: &[u8]) -> Sealed {
            let entropy = self.entropy();
            self.alice.encrypt(plaintext, &entropy, false).unwrap()
        }

        fn bob_seal(&mut self, plaintext: &[u8]) -> Sealed {
            let entropy = self.entropy();
            self.bob.encrypt(plaintext, &entropy, false).unwrap()
        }
    }

    fn pair(config: RatchetConfig) -> Pair {
        // Identity order decides roles
        let a = IdentityKeyPair::from_secret_bytes([1u8; 32]);
        let b = IdentityKeyPair::from_secret_bytes([2u8; 32]);
        let (alice_id, bob_id) =
            if a.public_bytes() < b.public_bytes() { (a, b) } else { (b, a) };

        let mut alice = RatchetState::new(
            &alice_id,
            &bob_id.public_bytes(),
            [10u8; 32],
            [11u8; 32],
            config.clone(),
        )
        .unwrap();
        let mut bob =
            RatchetState::new(&bob_id, &alice_id.public_bytes(), [20u8; 32], [21u8; 32], config)
                .unwrap();

        let (alice_eph, alice_ratchet) = (alice.ephemeral_public(), alice.ratchet_public());
        let (bob_eph, bob_ratchet) = (bob.ephemeral_public(), bob.ratchet_public());

        bob.derive_from_handshake(&bob_id, &alice_id.public_bytes(), &alice_eph, &alice_ratchet)
            .unwrap();
        alice
            .derive_from_handshake(&alice_id, &bob_id.public_bytes(), &bob_eph, &bob_ratchet)
            .unwrap();

        Pair { alice, bob, counter: 0 }
    }

    #[test]
    fn both_sides_agree_on_root_key() {
        let pair = pair(RatchetConfig::default());
        assert_eq!(pair.alice.root_key_digest(), pair.bob.root_key_digest());
        assert_eq!(pair.alice.role(), Role::Initiator);
        assert_eq!(pair.bob.role(), Role::Responder);
    }

    #[test]
    fn initiator_steps_on_first_message() {
        let mut pair = pair(RatchetConfig::default());
        let sealed = pair.alice_seal(b"hello");
        assert!(sealed.ratchet_stepped);

        let opened = pair.bob.decrypt(&sealed.message).unwrap();
        assert_eq!(opened.plaintext, b"hello");
        assert_eq!(opened.path, KeyPath::NextHeaderKey);
    }

    #[test]
    fn responder_can_send_before_receiving() {
        let mut pair = pair(RatchetConfig::default());
        let sealed = pair.bob_seal(b"early");
        assert!(!sealed.ratchet_stepped);

        let opened = pair.alice.decrypt(&sealed.message).unwrap();
        assert_eq!(opened.plaintext, b"early");
        assert_eq!(opened.path, KeyPath::Current);
    }

    #[test]
    fn duplicate_handshake_rejected() {
        let a = IdentityKeyPair::from_secret_bytes([1u8; 32]);
        let b = IdentityKeyPair::from_secret_bytes([2u8; 32]);
        let mut state = RatchetState::new(
            &a,
            &b.public_bytes(),
            [3u8; 32],
            [4u8; 32],
            RatchetConfig::default(),
        )
        .unwrap();
        let peer = RatchetState::new(
            &b,
            &a.public_bytes(),
            [5u8; 32],
            [6u8; 32],
            RatchetConfig::default(),
        )
        .unwrap();

        let (eph, ratchet) = (peer.ephemeral_public(), peer.ratchet_public());
        state.derive_from_handshake(&a, &b.public_bytes(), &eph, &ratchet).unwrap();
        assert!(state.matches_ephemeral(&eph));

        let again = state.derive_from_handshake(&a, &b.public_bytes(), &eph, &ratchet);
        assert_eq!(again, Err(RatchetError::DuplicateKeyExchange));
    }

    #[test]
    fn self_exchange_rejected() {
        let a = IdentityKeyPair::from_secret_bytes([1u8; 32]);
        let result = RatchetState::new(
            &a,
            &a.public_bytes(),
            [3u8; 32],
            [4u8; 32],
            RatchetConfig::default(),
        );
        assert!(matches!(result, Err(RatchetError::SelfKeyExchange)));
    }

    #[test]
    fn encrypt_before_handshake_fails() {
        let a = IdentityKeyPair::from_secret_bytes([1u8; 32]);
        let b = IdentityKeyPair::from_secret_bytes([2u8; 32]);
        let mut state = RatchetState::new(
            &a,
            &b.public_bytes(),
            [3u8; 32],
            [4u8; 32],
            RatchetConfig::default(),
        )
        .unwrap();
        let entropy = SealEntropy { ratchet_secret: [0u8; 32], header_nonce: [0u8; 24] };

        assert!(matches!(
            state.encrypt(b"x", &entropy, false),
            Err(RatchetError::Uninitialized)
        ));
    }

    #[test]
    fn out_of_order_uses_skipped_keys_once() {
        let mut pair = pair(RatchetConfig::default());
        let first = pair.alice_seal(b"one");
        let second = pair.alice_seal(b"two");
        let third = pair.alice_seal(b"three");

        assert_eq!(pair.bob.decrypt(&third.message).unwrap().plaintext, b"three");
        assert_eq!(pair.bob.skipped_len(), 2);

        let opened = pair.bob.decrypt(&first.message).unwrap();
        assert_eq!(opened.plaintext, b"one");
        assert_eq!(opened.path, KeyPath::Skipped);

        assert_eq!(pair.bob.decrypt(&second.message).unwrap().plaintext, b"two");
        assert_eq!(pair.bob.skipped_len(), 0);

        // Replays find nothing
        assert_eq!(pair.bob.decrypt(&first.message).unwrap_err(), RatchetError::AuthFailure);
    }

    #[test]
    fn skipped_store_opens_only_stored_frames() {
        let mut pair = pair(RatchetConfig::default());
        let first = pair.alice_seal(b"one");
        let second = pair.alice_seal(b"two");

        // Nothing stored yet
        assert_eq!(
            pair.bob.try_skipped_keys(&first.message).unwrap_err(),
            RatchetError::AuthFailure
        );

        assert_eq!(pair.bob.decrypt(&second.message).unwrap().plaintext, b"two");
        assert_eq!(pair.bob.skipped_len(), 1);

        let opened = pair.bob.try_skipped_keys(&first.message).unwrap();
        assert_eq!(opened.plaintext, b"one");
        assert_eq!(opened.path, KeyPath::Skipped);
        assert_eq!(pair.bob.skipped_len(), 0);

        // A frame on the live chain is not in the store
        let third = pair.alice_seal(b"three");
        assert_eq!(
            pair.bob.try_skipped_keys(&third.message).unwrap_err(),
            RatchetError::AuthFailure
        );
        assert_eq!(pair.bob.decrypt(&third.message).unwrap().plaintext, b"three");
    }

    #[test]
    fn failed_decrypt_leaves_state_untouched() {
        let mut pair = pair(RatchetConfig::default());
        let sealed = pair.alice_seal(b"payload");

        let mut tampered = sealed.message.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert_eq!(pair.bob.decrypt(&tampered).unwrap_err(), RatchetError::AuthFailure);

        assert_eq!(pair.bob.decrypt(&sealed.message).unwrap().plaintext, b"payload");
    }

    #[test]
    fn ratchet_step_waits_for_peer_confirmation() {
        let config = RatchetConfig { ratchet_messages: 2, ..RatchetConfig::default() };
        let mut pair = pair(config);

        // First message steps (pending after key exchange)
        assert!(pair.alice_seal(b"a").ratchet_stepped);
        // Bob has not answered: no further steps regardless of count
        for _ in 0..5 {
            assert!(!pair.alice_seal(b"b").ratchet_stepped);
        }

        let first = pair.alice_seal(b"c");
        pair.bob.decrypt(&first.message).unwrap();

        // Bob holds Alice's new key, so he may step once his threshold is hit
        let r1 = pair.bob_seal(b"r1");
        let r2 = pair.bob_seal(b"r2");
        assert!(!r1.ratchet_stepped);
        assert!(r2.ratchet_stepped);

        pair.alice.decrypt(&r1.message).unwrap();
        assert_eq!(pair.alice.decrypt(&r2.message).unwrap().path, KeyPath::NextHeaderKey);

        // Bob's step confirms Alice's key: her threshold applies again
        assert!(pair.alice_seal(b"d").ratchet_stepped);
    }

    #[test]
    fn gap_beyond_limit_is_rejected() {
        let config = RatchetConfig { max_key_gap: 4, ..RatchetConfig::default() };
        let mut pair = pair(config);

        let first = pair.alice_seal(b"0");
        pair.bob.decrypt(&first.message).unwrap();

        let mut last = None;
        for _ in 0..10 {
            last = Some(pair.alice_seal(b"later"));
        }
        let last = last.unwrap();
        assert_eq!(pair.bob.decrypt(&last.message).unwrap_err(), RatchetError::AuthFailure);
        assert_eq!(pair.bob.skipped_len(), 0);
    }

    #[test]
    fn fork_keeps_ratchet_key() {
        let pair = pair(RatchetConfig::default());
        let fork = pair.bob.fork();
        assert_eq!(fork.ratchet_public(), pair.bob.ratchet_public());
        assert_eq!(fork.ephemeral_public(), pair.bob.ephemeral_public());
        assert_eq!(fork.skipped_len(), 0);
    }
}
