//! Key-exchange state machine.
//!
//! Owns the ratchet states of one tunnel and decides which of them encrypts
//! and which may decrypt. Only the initiator (smaller identity) sends
//! [`KeyExchange`]; the responder answers with [`KeyExchangeAuth`], whose
//! `auth` field proves both sides derived the same root key.
//!
//! # State Machine
//!
//! ```text
//!                 initiator sends KX
//! ┌───────────────┐ ──────────────────> ┌──────┐
//! │ Uninitialized │                     │ Sent │
//! └───────────────┘ ──────┐             └──────┘
//!                         │ responder       │ valid KX_AUTH
//!                         │ receives KX     ↓
//!                         ↓             ┌───────┐
//!                     ┌──────┐          │ Ready │
//!                     │ Ping │ ───────> └───────┘
//!                     └──────┘  first frame decrypts
//!                               under the unverified state
//! ```
//!
//! # Key states
//!
//! - `verified`: the state used for encryption once `Ready`.
//! - `unverified`: derived from a received exchange that has not yet been
//!   confirmed by a successfully decrypted frame. Promoted on first success,
//!   dropped after too many failures.
//! - `pending`: the initiator's fresh keys during an explicit re-key. The
//!   verified state keeps encrypting until the peer's auth arrives.

use std::{sync::Arc, time::Duration};

use cadet_crypto::{
    IdentityKeyPair, RatchetConfig, RatchetError, RatchetState, Role, SealEntropy, SealedMessage,
};
use cadet_proto::{EncryptedFrame, KeyExchange, KeyExchangeAuth, KxFlags, PeerId, TunnelMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    env::{Environment, Timestamp},
    error::TunnelError,
    timer::std_backoff,
};

/// Delay before the first key-exchange retry.
pub const DEFAULT_KX_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Ceiling for the key-exchange retry backoff.
pub const DEFAULT_KX_MAX_RETRY_DELAY: Duration = Duration::from_secs(15 * 60);

/// Failed decryptions tolerated before an unverified state is discarded.
pub const DEFAULT_MAX_UNVERIFIED_ATTEMPTS: u32 = 16;

/// Unanswered retries after which a stall is reported.
pub const DEFAULT_STALL_AFTER_RETRIES: u32 = 8;

/// Key-exchange configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyExchangeConfig {
    /// Delay before the first retry; doubled on every retry
    pub initial_retry_delay: Duration,
    /// Upper bound for the retry delay
    pub max_retry_delay: Duration,
    /// Failed decryptions before an unverified state is dropped
    pub max_unverified_attempts: u32,
    /// Retries without progress before `Stalled` is reported
    pub stall_after_retries: u32,
    /// Re-key automatically after this many encrypted frames (initiator only)
    pub rekey_after_frames: Option<u64>,
}

impl Default for KeyExchangeConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: DEFAULT_KX_INITIAL_RETRY_DELAY,
            max_retry_delay: DEFAULT_KX_MAX_RETRY_DELAY,
            max_unverified_attempts: DEFAULT_MAX_UNVERIFIED_ATTEMPTS,
            stall_after_retries: DEFAULT_STALL_AFTER_RETRIES,
            rekey_after_frames: None,
        }
    }
}

/// Externally visible key-exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxState {
    /// No key material exchanged
    Uninitialized,
    /// Initiator sent its exchange, waiting for auth
    Sent,
    /// Responder derived keys, waiting for the first frame
    Ping,
    /// Keys confirmed; encryption allowed
    Ready,
}

/// Actions returned by the key-exchange machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KxAction<I> {
    /// Transmit this cleartext message on any ready connection
    Send(TunnelMessage),
    /// (Re)arm the retry timer
    ScheduleRetry(I),
    /// Disarm the retry timer
    CancelRetry,
    /// Entered [`KxState::Ready`] for the first time
    BecameReady,
    /// A re-key completed; new keys are in use
    Rekeyed,
    /// Retries keep going unanswered
    Stalled,
}

/// Outcome of an inbound encrypted frame.
#[derive(Debug)]
pub struct Received<I> {
    /// Decrypted plaintext, or why there is none
    pub result: Result<Vec<u8>, TunnelError>,
    /// Side effects
    pub actions: Vec<KxAction<I>>,
}

/// Key-exchange state machine for one tunnel.
///
/// Pure: no I/O and no stored environment. Entropy comes from the `env`
/// parameter of the methods that need it.
pub struct KxMachine<I> {
    identity: Arc<IdentityKeyPair>,
    peer: PeerId,
    role: Role,
    state: KxState,
    verified: RatchetState,
    unverified: Option<RatchetState>,
    unverified_attempts: u32,
    pending: Option<RatchetState>,
    /// Keys replaced by a re-key; opens frames the peer sealed before it
    /// learned the new keys, until one arrives under the new keys
    retired: Option<RatchetState>,
    retry_delay: Duration,
    retry_armed: bool,
    retries: u32,
    stall_reported: bool,
    ratchet_deadline: Option<I>,
    config: KeyExchangeConfig,
    ratchet_config: RatchetConfig,
}

impl<I: Timestamp> KxMachine<I> {
    /// Create the machine with fresh ephemeral and ratchet keys.
    ///
    /// # Errors
    ///
    /// - `TunnelError::Crypto(SelfKeyExchange)` if `peer` is our own identity
    pub fn new<E: Environment<Instant = I>>(
        identity: Arc<IdentityKeyPair>,
        peer: PeerId,
        config: KeyExchangeConfig,
        ratchet_config: RatchetConfig,
        env: &E,
    ) -> Result<Self, TunnelError> {
        let role = Role::from_identities(&identity.public_bytes(), peer.as_bytes())
            .ok_or(RatchetError::SelfKeyExchange)?;
        let verified = RatchetState::new(
            &identity,
            peer.as_bytes(),
            env.random_array(),
            env.random_array(),
            ratchet_config.clone(),
        )?;

        Ok(Self {
            identity,
            peer,
            role,
            state: KxState::Uninitialized,
            verified,
            unverified: None,
            unverified_attempts: 0,
            pending: None,
            retired: None,
            retry_delay: config.initial_retry_delay,
            retry_armed: false,
            retries: 0,
            stall_reported: false,
            ratchet_deadline: None,
            config,
            ratchet_config,
        })
    }

    /// Current state.
    pub fn state(&self) -> KxState {
        self.state
    }

    /// Our role in this tunnel.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether frames may be encrypted.
    pub fn is_ready(&self) -> bool {
        self.state == KxState::Ready
    }

    /// Whether an initiator re-key is awaiting the peer's auth.
    pub fn rekey_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a received exchange awaits confirmation.
    pub fn has_unverified(&self) -> bool {
        self.unverified.is_some()
    }

    /// Whether the retry timer is armed.
    pub fn retry_armed(&self) -> bool {
        self.retry_armed
    }

    /// The state used for encryption.
    pub fn verified(&self) -> &RatchetState {
        &self.verified
    }

    /// Configuration.
    pub fn config(&self) -> &KeyExchangeConfig {
        &self.config
    }

    /// Begin the exchange if nothing was exchanged yet.
    ///
    /// The initiator sends its exchange. The responder cannot derive keys on
    /// its own and sends a hello asking the initiator to start.
    pub fn start(&mut self, now: I) -> Vec<KxAction<I>> {
        let mut actions = Vec::new();
        if self.state == KxState::Uninitialized && !self.retry_armed {
            self.request_exchange(now, &mut actions);
        }
        actions
    }

    /// Start an explicit re-key with fresh ephemeral and ratchet keys.
    ///
    /// Only the initiator re-keys, and only from `Ready`. The verified state
    /// keeps encrypting until the peer authenticates the new keys.
    pub fn rekey<E: Environment<Instant = I>>(&mut self, now: I, env: &E) -> Vec<KxAction<I>> {
        let mut actions = Vec::new();
        if self.role != Role::Initiator || self.state != KxState::Ready || self.pending.is_some()
        {
            debug!(peer = %self.peer, state = ?self.state, "re-key not applicable");
            return actions;
        }

        let fresh = match RatchetState::new(
            &self.identity,
            self.peer.as_bytes(),
            env.random_array(),
            env.random_array(),
            self.ratchet_config.clone(),
        ) {
            Ok(fresh) => fresh,
            Err(error) => {
                warn!(peer = %self.peer, %error, "re-key failed");
                return actions;
            },
        };

        info!(peer = %self.peer, "starting re-key");
        self.pending = Some(fresh);
        self.retry_delay = self.config.initial_retry_delay;
        self.send_kx(now, &mut actions);
        actions
    }

    /// Retry timer fired.
    ///
    /// `wants_traffic` asks the peer to answer our auth even if it believes
    /// it is up to date, so a responder with queued data is not left waiting.
    pub fn on_retry_timer(&mut self, now: I, wants_traffic: bool) -> Vec<KxAction<I>> {
        let mut actions = Vec::new();
        self.retry_armed = false;

        let resend = match (self.state, self.role) {
            (KxState::Uninitialized | KxState::Sent, Role::Initiator) => true,
            (KxState::Ping, _) => true,
            (KxState::Ready, Role::Initiator) => self.pending.is_some(),
            (KxState::Ready, Role::Responder) => self.unverified.is_some(),
            (KxState::Uninitialized, Role::Responder) => true,
            (KxState::Sent, Role::Responder) => false,
        };
        if !resend {
            return actions;
        }

        self.retries += 1;
        if self.retries >= self.config.stall_after_retries && !self.stall_reported {
            warn!(peer = %self.peer, retries = self.retries, "key exchange stalled");
            self.stall_reported = true;
            actions.push(KxAction::Stalled);
        }

        match (self.role, self.state) {
            (Role::Initiator, _) | (Role::Responder, KxState::Uninitialized) => {
                self.request_exchange(now, &mut actions);
            },
            (Role::Responder, _) => self.send_kx_auth(true, wants_traffic, now, &mut actions),
        }
        actions
    }

    /// Handle a received [`KeyExchange`].
    ///
    /// A responder's exchange carries no usable keys for us; with
    /// `force_reply` set it asks the initiator to (re)send its own.
    pub fn handle_kx(&mut self, kx: &KeyExchange, now: I, wants_traffic: bool) -> Vec<KxAction<I>> {
        let mut actions = Vec::new();
        if self.role == Role::Initiator {
            if kx.flags.force_reply && !self.retry_armed {
                debug!(peer = %self.peer, "responder requests a key exchange");
                self.send_kx(now, &mut actions);
            } else {
                debug!(peer = %self.peer, "ignoring key exchange sent by responder");
            }
            return actions;
        }

        if self.verified.matches_ephemeral(&kx.ephemeral) {
            debug!(peer = %self.peer, "duplicate key exchange, resending auth");
            self.send_kx_auth(false, false, now, &mut actions);
            return actions;
        }
        if self.unverified.as_ref().is_some_and(|s| s.matches_ephemeral(&kx.ephemeral)) {
            debug!(peer = %self.peer, "repeated key exchange, resending auth");
            self.send_kx_auth(true, false, now, &mut actions);
            return actions;
        }

        let mut fresh = self.verified.fork();
        match fresh.derive_from_handshake(
            &self.identity,
            self.peer.as_bytes(),
            &kx.ephemeral,
            &kx.ratchet,
        ) {
            Ok(()) => {},
            Err(RatchetError::DuplicateKeyExchange) => {
                debug!(peer = %self.peer, "key exchange yields known keys");
                return actions;
            },
            Err(error) => {
                warn!(peer = %self.peer, %error, "key exchange rejected");
                return actions;
            },
        }

        debug!(peer = %self.peer, state = ?self.state, "derived unverified keys");
        self.unverified = Some(fresh);
        self.unverified_attempts = 0;

        self.send_kx_auth(true, wants_traffic, now, &mut actions);
        actions
    }

    /// Handle a received [`KeyExchangeAuth`].
    pub fn handle_kx_auth(&mut self, auth: &KeyExchangeAuth, now: I) -> Vec<KxAction<I>> {
        let mut actions = Vec::new();
        if self.state == KxState::Uninitialized {
            debug!(peer = %self.peer, "auth before any exchange, ignoring");
            return actions;
        }

        let mut candidate = self.pending.clone().unwrap_or_else(|| self.verified.clone());
        match candidate.derive_from_handshake(
            &self.identity,
            self.peer.as_bytes(),
            &auth.kx.ephemeral,
            &auth.kx.ratchet,
        ) {
            Ok(()) => {},
            Err(RatchetError::DuplicateKeyExchange) => {
                debug!(peer = %self.peer, "redundant auth");
                if auth.kx.flags.force_reply {
                    self.send_kx_auth(false, false, now, &mut actions);
                }
                return actions;
            },
            Err(error) => {
                warn!(peer = %self.peer, %error, "auth rejected");
                return actions;
            },
        }

        if candidate.root_key_digest() != auth.auth {
            warn!(peer = %self.peer, "key exchange auth mismatch");
            self.arm_retry(now, &mut actions);
            return actions;
        }

        let rekeyed = self.state == KxState::Ready;
        let previous = std::mem::replace(&mut self.verified, candidate);
        self.retired = rekeyed.then_some(previous);
        self.pending = None;
        self.unverified = None;
        self.progress(now, &mut actions);
        if rekeyed {
            info!(peer = %self.peer, "re-key complete");
            actions.push(KxAction::Rekeyed);
        }

        if auth.kx.flags.force_reply {
            self.send_kx_auth(false, false, now, &mut actions);
        }
        actions
    }

    /// Decrypt an inbound frame with the verified or unverified state.
    pub fn decrypt(&mut self, frame: &EncryptedFrame, now: I) -> Received<I> {
        let mut actions = Vec::new();

        if matches!(self.state, KxState::Uninitialized | KxState::Sent) {
            if !self.retry_armed {
                self.request_exchange(now, &mut actions);
            }
            return Received { result: Err(TunnelError::NotReady), actions };
        }

        let sealed = SealedMessage {
            header_nonce: frame.header_nonce,
            header: frame.header.to_vec(),
            ciphertext: frame.ciphertext.to_vec(),
            mac: frame.mac,
        };

        if self.state == KxState::Ready {
            if let Ok(opened) = self.verified.decrypt(&sealed) {
                if self.retired.take().is_some() {
                    debug!(peer = %self.peer, "peer uses new keys, dropping retired keys");
                }
                return Received { result: Ok(opened.plaintext), actions };
            }
            if let Some(retired) = self.retired.as_mut()
                && let Ok(opened) = retired.decrypt(&sealed)
            {
                trace!(peer = %self.peer, "frame opened with retired keys");
                return Received { result: Ok(opened.plaintext), actions };
            }
        }

        if let Some(unverified) = self.unverified.as_mut() {
            match unverified.decrypt(&sealed) {
                Ok(opened) => {
                    debug!(peer = %self.peer, "unverified keys confirmed");
                    if let Some(promoted) = self.unverified.take() {
                        let previous = std::mem::replace(&mut self.verified, promoted);
                        if self.state == KxState::Ready {
                            self.retired = Some(previous);
                        }
                    }
                    self.progress(now, &mut actions);
                    return Received { result: Ok(opened.plaintext), actions };
                },
                Err(_) => {
                    self.unverified_attempts += 1;
                    if self.unverified_attempts > self.config.max_unverified_attempts {
                        warn!(
                            peer = %self.peer,
                            attempts = self.unverified_attempts,
                            "discarding unverified keys"
                        );
                        self.unverified = None;
                    }
                },
            }
        }

        debug!(peer = %self.peer, state = ?self.state, "frame failed authentication");
        if !self.retry_armed {
            self.request_exchange(now, &mut actions);
        }
        Received { result: Err(TunnelError::AuthFailure), actions }
    }

    /// Encrypt a plaintext with the verified state.
    ///
    /// Only [`KxState::Ready`] encrypts. A responder in [`KxState::Ping`]
    /// holds keys but does not send on them: its records stay queued, and
    /// when it has traffic its auth carries `force_reply`, so the initiator's
    /// answering auth confirms the keys without waiting for a data frame.
    ///
    /// Requests a DH ratchet step once the time threshold has passed.
    ///
    /// # Errors
    ///
    /// - `TunnelError::NotReady` before the exchange completes
    /// - `TunnelError::Crypto` if the ratchet refuses
    pub fn encrypt<E: Environment<Instant = I>>(
        &mut self,
        plaintext: &[u8],
        now: I,
        env: &E,
    ) -> Result<SealedMessage, TunnelError> {
        if self.state != KxState::Ready {
            return Err(TunnelError::NotReady);
        }

        let step_due = self.ratchet_deadline.is_some_and(|deadline| now >= deadline);
        let entropy =
            SealEntropy { ratchet_secret: env.random_array(), header_nonce: env.random_array() };
        let sealed = self.verified.encrypt(plaintext, &entropy, step_due)?;
        if sealed.ratchet_stepped {
            debug!(peer = %self.peer, "ratchet stepped");
            self.ratchet_deadline = Some(now + self.ratchet_config.ratchet_time);
        }
        Ok(sealed.message)
    }

    fn kx_record(state: &RatchetState, force_reply: bool) -> KeyExchange {
        KeyExchange {
            flags: KxFlags { force_reply },
            ephemeral: state.ephemeral_public(),
            ratchet: state.ratchet_public(),
        }
    }

    /// Undecryptable traffic: the initiator resends its exchange, the
    /// responder asks the initiator to do so.
    fn request_exchange(&mut self, now: I, actions: &mut Vec<KxAction<I>>) {
        match self.role {
            Role::Initiator => self.send_kx(now, actions),
            Role::Responder => {
                debug!(peer = %self.peer, "asking initiator for a key exchange");
                let kx = Self::kx_record(&self.verified, true);
                actions.push(KxAction::Send(TunnelMessage::KeyExchange(kx)));
                self.arm_retry(now, actions);
            },
        }
    }

    fn send_kx(&mut self, now: I, actions: &mut Vec<KxAction<I>>) {
        if self.role != Role::Initiator {
            return;
        }
        let source = self.pending.as_ref().unwrap_or(&self.verified);
        let kx = Self::kx_record(source, true);
        debug!(peer = %self.peer, rekey = self.pending.is_some(), "sending key exchange");
        actions.push(KxAction::Send(TunnelMessage::KeyExchange(kx)));

        if self.state == KxState::Uninitialized {
            self.state = KxState::Sent;
        }
        self.arm_retry(now, actions);
    }

    fn send_kx_auth(
        &mut self,
        use_unverified: bool,
        force_reply: bool,
        now: I,
        actions: &mut Vec<KxAction<I>>,
    ) {
        let source = if use_unverified {
            self.unverified.as_ref().unwrap_or(&self.verified)
        } else {
            &self.verified
        };
        let auth = KeyExchangeAuth {
            kx: Self::kx_record(source, force_reply),
            auth: source.root_key_digest(),
        };
        debug!(peer = %self.peer, force_reply, "sending key exchange auth");
        actions.push(KxAction::Send(TunnelMessage::KeyExchangeAuth(auth)));

        if self.state != KxState::Ready {
            self.state = KxState::Ping;
            self.arm_retry(now, actions);
        }
    }

    fn arm_retry(&mut self, now: I, actions: &mut Vec<KxAction<I>>) {
        actions.push(KxAction::ScheduleRetry(now + self.retry_delay));
        self.retry_delay = std_backoff(self.retry_delay).min(self.config.max_retry_delay);
        self.retry_armed = true;
    }

    /// Keys were confirmed: reset retry bookkeeping and enter `Ready`.
    fn progress(&mut self, now: I, actions: &mut Vec<KxAction<I>>) {
        self.unverified_attempts = 0;
        self.retries = 0;
        self.stall_reported = false;
        self.retry_delay = self.config.initial_retry_delay;
        self.ratchet_deadline = Some(now + self.ratchet_config.ratchet_time);
        if self.retry_armed && self.pending.is_none() && self.unverified.is_none() {
            self.retry_armed = false;
            actions.push(KxAction::CancelRetry);
        }

        if self.state != KxState::Ready {
            info!(peer = %self.peer, role = ?self.role, "tunnel keys ready");
            self.state = KxState::Ready;
            actions.push(KxAction::BecameReady);
        }
    }
}

impl<I> std::fmt::Debug for KxMachine<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KxMachine")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("unverified", &self.unverified.is_some())
            .field("pending", &self.pending.is_some())
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
