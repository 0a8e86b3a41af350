//! Plaintext records carried inside an encrypted frame.
//!
//! A decrypted frame holds one or more records, each framed as
//! `[kind: u8][len: u16 BE][CBOR body]`. The kind byte identifies the body
//! type, so the body is serialized without a variant tag.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::{ChannelNumber, Mid, PortHash},
    message::{MAX_FRAME_OVERHEAD, MAX_MESSAGE_SIZE},
};

/// Record prefix: kind byte plus length.
pub const RECORD_PREFIX_SIZE: usize = 3;

/// Maximum encoded record body.
pub const MAX_RECORD_BODY: usize = u16::MAX as usize;

/// Upper bound on the CBOR an [`AppData`] body spends besides its payload.
pub const MAX_APP_DATA_OVERHEAD: usize = 64;

/// Largest application payload that fits a single record in a single frame.
pub const MAX_PAYLOAD_SIZE: usize =
    MAX_MESSAGE_SIZE - MAX_FRAME_OVERHEAD - RECORD_PREFIX_SIZE - MAX_APP_DATA_OVERHEAD;

const _: () = assert!(MAX_PAYLOAD_SIZE + MAX_APP_DATA_OVERHEAD <= MAX_RECORD_BODY);

/// Record type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Open a channel
    ChannelOpen = 0x01,
    /// Confirm a channel open
    ChannelOpenAck = 0x02,
    /// Tear down a channel
    ChannelDestroy = 0x03,
    /// Application payload
    AppData = 0x04,
    /// Cumulative and selective acknowledgment
    AppDataAck = 0x05,
    /// Tunnel liveness probe
    Keepalive = 0x06,
}

impl RecordKind {
    /// Parse a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ChannelOpen),
            0x02 => Some(Self::ChannelOpenAck),
            0x03 => Some(Self::ChannelDestroy),
            0x04 => Some(Self::AppData),
            0x05 => Some(Self::AppDataAck),
            0x06 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

/// Channel delivery options, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Retransmit until acknowledged
    pub reliable: bool,
    /// Deliver as soon as the consumer is ready, regardless of sequence
    pub out_of_order: bool,
    /// Allow only one unacknowledged message in flight
    pub no_buffer: bool,
}

impl ChannelOptions {
    /// Reliable, in-order, buffered.
    pub const fn reliable() -> Self {
        Self { reliable: true, out_of_order: false, no_buffer: false }
    }

    /// Best-effort, in-order, buffered.
    pub const fn unreliable() -> Self {
        Self { reliable: false, out_of_order: false, no_buffer: false }
    }

    /// Same options with out-of-order delivery.
    #[must_use]
    pub const fn with_out_of_order(mut self) -> Self {
        self.out_of_order = true;
        self
    }

    /// Same options with a single-message window.
    #[must_use]
    pub const fn with_no_buffer(mut self) -> Self {
        self.no_buffer = true;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::reliable()
    }
}

/// Request to open a channel on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelOpen {
    /// Number chosen by the opener
    pub ctn: ChannelNumber,
    /// Hashed destination port
    pub port: PortHash,
    /// Delivery options
    pub options: ChannelOptions,
}

/// Confirmation that a channel was bound to a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelOpenAck {
    /// Channel being confirmed
    pub ctn: ChannelNumber,
    /// Port the channel was bound to; must match the open request
    pub port: PortHash,
}

/// Channel teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelDestroy {
    /// Channel to tear down
    pub ctn: ChannelNumber,
}

/// Application payload on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppData {
    /// Target channel
    pub ctn: ChannelNumber,
    /// Sequence number
    pub mid: Mid,
    /// Payload bytes
    pub payload: Bytes,
}

/// Acknowledgment for application payloads.
///
/// Everything before `mid` was received. Bit `i` of `futures` set means
/// `mid + 1 + i` was received as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppDataAck {
    /// Acknowledged channel
    pub ctn: ChannelNumber,
    /// Next sequence number the receiver expects
    pub mid: Mid,
    /// Bitmask of sequence numbers received after `mid`
    pub futures: u64,
}

/// A plaintext record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRecord {
    /// See [`ChannelOpen`]
    ChannelOpen(ChannelOpen),
    /// See [`ChannelOpenAck`]
    ChannelOpenAck(ChannelOpenAck),
    /// See [`ChannelDestroy`]
    ChannelDestroy(ChannelDestroy),
    /// See [`AppData`]
    AppData(AppData),
    /// See [`AppDataAck`]
    AppDataAck(AppDataAck),
    /// Liveness probe with no body
    Keepalive,
}

impl ChannelRecord {
    /// Kind byte for this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::ChannelOpen(_) => RecordKind::ChannelOpen,
            Self::ChannelOpenAck(_) => RecordKind::ChannelOpenAck,
            Self::ChannelDestroy(_) => RecordKind::ChannelDestroy,
            Self::AppData(_) => RecordKind::AppData,
            Self::AppDataAck(_) => RecordKind::AppDataAck,
            Self::Keepalive => RecordKind::Keepalive,
        }
    }

    /// Channel this record addresses, if any.
    pub fn ctn(&self) -> Option<ChannelNumber> {
        match self {
            Self::ChannelOpen(r) => Some(r.ctn),
            Self::ChannelOpenAck(r) => Some(r.ctn),
            Self::ChannelDestroy(r) => Some(r.ctn),
            Self::AppData(r) => Some(r.ctn),
            Self::AppDataAck(r) => Some(r.ctn),
            Self::Keepalive => None,
        }
    }

    /// Append this record, with its prefix, to `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    /// - `ProtocolError::RecordTooLarge` if the body exceeds
    ///   [`MAX_RECORD_BODY`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut body = Vec::new();
        match self {
            Self::ChannelOpen(inner) => ciborium::ser::into_writer(inner, &mut body),
            Self::ChannelOpenAck(inner) => ciborium::ser::into_writer(inner, &mut body),
            Self::ChannelDestroy(inner) => ciborium::ser::into_writer(inner, &mut body),
            Self::AppData(inner) => ciborium::ser::into_writer(inner, &mut body),
            Self::AppDataAck(inner) => ciborium::ser::into_writer(inner, &mut body),
            Self::Keepalive => Ok(()),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        let Ok(len) = u16::try_from(body.len()) else {
            return Err(ProtocolError::RecordTooLarge { size: body.len(), max: MAX_RECORD_BODY });
        };

        dst.put_u8(self.kind() as u8);
        dst.put_u16(len);
        dst.put_slice(&body);
        Ok(())
    }

    /// Decode one record from the front of `src`, advancing it.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if the prefix or body is incomplete
    /// - `ProtocolError::UnknownKind` for an unrecognized kind byte
    /// - `ProtocolError::CborDecode` if the body is not valid CBOR for the kind
    /// - `ProtocolError::TrailingBytes` if the body has unread bytes
    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < RECORD_PREFIX_SIZE {
            return Err(ProtocolError::Truncated {
                needed: RECORD_PREFIX_SIZE,
                available: src.remaining(),
            });
        }

        let kind_byte = src.get_u8();
        let len = src.get_u16() as usize;
        let kind = RecordKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

        if src.remaining() < len {
            return Err(ProtocolError::Truncated { needed: len, available: src.remaining() });
        }
        let body = src.copy_to_bytes(len);

        let record = match kind {
            RecordKind::ChannelOpen => Self::ChannelOpen(decode_body(&body)?),
            RecordKind::ChannelOpenAck => Self::ChannelOpenAck(decode_body(&body)?),
            RecordKind::ChannelDestroy => Self::ChannelDestroy(decode_body(&body)?),
            RecordKind::AppData => Self::AppData(decode_body(&body)?),
            RecordKind::AppDataAck => Self::AppDataAck(decode_body(&body)?),
            RecordKind::Keepalive => {
                if !body.is_empty() {
                    return Err(ProtocolError::TrailingBytes(body.len()));
                }
                Self::Keepalive
            },
        };
        Ok(record)
    }
}

/// Encode a batch of records into one plaintext buffer.
pub fn encode_records(records: &[ChannelRecord]) -> Result<Bytes> {
    let mut buf = Vec::new();
    for record in records {
        record.encode(&mut buf)?;
    }
    Ok(Bytes::from(buf))
}

/// Decode every record in a plaintext buffer.
///
/// Fails on the first malformed record; records before it are discarded
/// with the rest of the frame.
pub fn decode_records(mut src: &[u8]) -> Result<Vec<ChannelRecord>> {
    let mut records = Vec::new();
    while !src.is_empty() {
        records.push(ChannelRecord::decode(&mut src)?);
    }
    Ok(records)
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    let mut reader = body;
    let value =
        ciborium::de::from_reader(&mut reader).map_err(|e| ProtocolError::CborDecode(e.to_string()))?;
    if !reader.is_empty() {
        return Err(ProtocolError::TrailingBytes(reader.len()));
    }
    Ok(value)
}
