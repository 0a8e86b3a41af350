//! Fuzz target for the ratchet engine
//!
//! Two states agree on keys, then exchange frames under a fuzzer-chosen
//! schedule of sends, deliveries, drops and forgeries.
//!
//! # Invariants
//!
//! - Decryption never panics, whatever the frame
//! - A genuine frame delivered once opens to exactly what was sealed
//! - A frame with any bit flipped never opens
//! - A frame that opened never opens again

#![no_main]

use arbitrary::Arbitrary;
use cadet_crypto::{IdentityKeyPair, RatchetConfig, RatchetState, SealEntropy, SealedMessage};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    /// Seal a payload on one side
    Send { from_alice: bool, payload: Vec<u8>, step_due: bool },
    /// Deliver an in-flight frame, picked by index
    Deliver { index: u8 },
    /// Deliver a copy of an in-flight frame with one bit flipped
    Forge { index: u8, byte: u16, bit: u8 },
    /// Replay a frame that was already delivered
    Replay { index: u8 },
    /// Deliver arbitrary bytes as a frame
    Garbage { to_alice: bool, header: Vec<u8>, ciphertext: Vec<u8>, mac: [u8; 32] },
}

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    max_skipped: u8,
    operations: Vec<Operation>,
}

struct Frame {
    to_alice: bool,
    message: SealedMessage,
    payload: Vec<u8>,
}

fn pair(config: RatchetConfig) -> (RatchetState, RatchetState) {
    let a = IdentityKeyPair::from_secret_bytes([0x11; 32]);
    let b = IdentityKeyPair::from_secret_bytes([0x22; 32]);
    let (alice_id, bob_id) = if a.public_bytes() < b.public_bytes() { (a, b) } else { (b, a) };
    let mut alice =
        RatchetState::new(&alice_id, &bob_id.public_bytes(), [1; 32], [2; 32], config.clone())
            .expect("distinct identities");
    let mut bob = RatchetState::new(&bob_id, &alice_id.public_bytes(), [3; 32], [4; 32], config)
        .expect("distinct identities");
    let (alice_eph, alice_ratchet) = (alice.ephemeral_public(), alice.ratchet_public());
    let (bob_eph, bob_ratchet) = (bob.ephemeral_public(), bob.ratchet_public());
    bob.derive_from_handshake(&bob_id, &alice_id.public_bytes(), &alice_eph, &alice_ratchet)
        .expect("fresh handshake");
    alice
        .derive_from_handshake(&alice_id, &bob_id.public_bytes(), &bob_eph, &bob_ratchet)
        .expect("fresh handshake");
    (alice, bob)
}

fn flip(message: &SealedMessage, byte: u16, bit: u8) -> SealedMessage {
    let mut forged = message.clone();
    let total = forged.header_nonce.len() + forged.header.len() + forged.ciphertext.len() + 32;
    let mut at = usize::from(byte) % total;
    let mask = 1u8 << (bit % 8);
    for part in [
        &mut forged.header_nonce[..],
        &mut forged.header[..],
        &mut forged.ciphertext[..],
        &mut forged.mac[..],
    ] {
        if at < part.len() {
            part[at] ^= mask;
            break;
        }
        at -= part.len();
    }
    forged
}

fuzz_target!(|scenario: Scenario| {
    let config = RatchetConfig {
        max_skipped_keys: usize::from(scenario.max_skipped.max(1)),
        ..RatchetConfig::default()
    };
    let (mut alice, mut bob) = pair(config);
    let mut in_flight: Vec<Frame> = Vec::new();
    let mut delivered: Vec<Frame> = Vec::new();
    let mut counter = 0u64;

    for operation in scenario.operations.into_iter().take(256) {
        match operation {
            Operation::Send { from_alice, payload, step_due } => {
                counter += 1;
                let mut ratchet_secret = [0x5A; 32];
                ratchet_secret[..8].copy_from_slice(&counter.to_be_bytes());
                let mut header_nonce = [0u8; 24];
                header_nonce[..8].copy_from_slice(&counter.to_be_bytes());
                let entropy = SealEntropy { ratchet_secret, header_nonce };
                let sender = if from_alice { &mut alice } else { &mut bob };
                if let Ok(sealed) = sender.encrypt(&payload, &entropy, step_due) {
                    in_flight.push(Frame { to_alice: !from_alice, message: sealed.message, payload });
                }
            },
            Operation::Deliver { index } => {
                if in_flight.is_empty() {
                    continue;
                }
                let frame = in_flight.remove(usize::from(index) % in_flight.len());
                let receiver = if frame.to_alice { &mut alice } else { &mut bob };
                // Too many skipped keys may make a genuine frame unreadable,
                // but never readable as something else.
                if let Ok(opened) = receiver.decrypt(&frame.message) {
                    assert_eq!(opened.plaintext, frame.payload);
                    delivered.push(frame);
                }
            },
            Operation::Forge { index, byte, bit } => {
                let Some(frame) = in_flight.get(usize::from(index) % in_flight.len().max(1)) else {
                    continue;
                };
                let forged = flip(&frame.message, byte, bit);
                let receiver = if frame.to_alice { &mut alice } else { &mut bob };
                assert!(receiver.decrypt(&forged).is_err(), "forged frame opened");
            },
            Operation::Replay { index } => {
                let Some(frame) = delivered.get(usize::from(index) % delivered.len().max(1)) else {
                    continue;
                };
                let receiver = if frame.to_alice { &mut alice } else { &mut bob };
                assert!(receiver.decrypt(&frame.message).is_err(), "replayed frame opened");
            },
            Operation::Garbage { to_alice, header, ciphertext, mac } => {
                let receiver = if to_alice { &mut alice } else { &mut bob };
                let message = SealedMessage { header_nonce: [0; 24], header, ciphertext, mac };
                let _ = receiver.decrypt(&message);
            },
        }
    }
});
