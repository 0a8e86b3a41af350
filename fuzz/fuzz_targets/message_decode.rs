//! Fuzz target for TunnelMessage::decode
//!
//! Arbitrary bytes arriving on a connection. Decoding must never panic, and
//! anything that decodes must re-encode to a message that decodes the same.

#![no_main]

use cadet_proto::TunnelMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = TunnelMessage::decode(data) else {
        return;
    };
    let encoded = message.encode().expect("decoded message must re-encode");
    let again = TunnelMessage::decode(&encoded).expect("re-encoded message must decode");
    assert_eq!(again, message);
});
