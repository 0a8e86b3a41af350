//! CADET wire records
//!
//! Messages exchanged between the two endpoints of a tunnel. The outer
//! hop-by-hop forwarding format is not part of this crate: a
//! [`TunnelMessage`] is the unit handed to and received from a connection.
//!
//! ```text
//! TunnelMessage
//! ├── KeyExchange       (clear)  ephemeral + ratchet public keys
//! ├── KeyExchangeAuth   (clear)  KeyExchange + H(root key)
//! └── Encrypted                  header nonce, E(header), E(records), MAC
//!                                   │
//!                                   ▼ decrypt
//!                     [ChannelRecord][ChannelRecord]...
//!                     ChannelOpen | ChannelOpenAck | ChannelDestroy
//!                     AppData | AppDataAck | Keepalive
//! ```
//!
//! Bodies are CBOR. A kind byte in front of every message and record
//! identifies the body type, so bodies carry no variant tag.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod ids;
pub mod message;
pub mod records;

pub use errors::{ProtocolError, Result};
pub use ids::{ChannelNumber, ConnectionId, Mid, PeerId, PortHash};
pub use message::{
    EncryptedFrame, KeyExchange, KeyExchangeAuth, KxFlags, MAX_FRAME_OVERHEAD, MAX_MESSAGE_SIZE,
    MessageKind, TunnelMessage,
};
pub use records::{
    AppData, AppDataAck, ChannelDestroy, ChannelOpen, ChannelOpenAck, ChannelOptions,
    ChannelRecord, MAX_APP_DATA_OVERHEAD, MAX_PAYLOAD_SIZE, MAX_RECORD_BODY, RecordKind,
    decode_records, encode_records,
};
