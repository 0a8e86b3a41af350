//! Fuzz target for decode_records
//!
//! Decrypted frame bodies are only as trustworthy as the peer that sealed
//! them, so the record decoder sees hostile input after every successful
//! decryption.
//!
//! # Invariants
//!
//! - Never panics; malformed input is an error
//! - Whatever decodes re-encodes and decodes to the same records

#![no_main]

use cadet_proto::{decode_records, encode_records};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(records) = decode_records(data) else {
        return;
    };
    let encoded = encode_records(&records).expect("decoded records must re-encode");
    let again = decode_records(&encoded).expect("re-encoded records must decode");
    assert_eq!(again, records);
});
