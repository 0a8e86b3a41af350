//! Messages exchanged between tunnel endpoints.
//!
//! Layout on the wire: `[kind: u8][CBOR body]`. Key-exchange messages travel
//! in the clear; everything else is an [`EncryptedFrame`] whose plaintext is
//! a sequence of [`ChannelRecord`](crate::ChannelRecord)s.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::ConnectionId,
};

/// Maximum encoded tunnel message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upper bound on the bytes an encrypted frame adds around its plaintext:
/// kind byte, CBOR field names, nonce, encrypted header, MAC and AEAD tag.
pub const MAX_FRAME_OVERHEAD: usize = 512;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Initiator's key material
    KeyExchange = 0x10,
    /// Responder's key material plus proof of agreement
    KeyExchangeAuth = 0x11,
    /// Ratchet-encrypted frame
    Encrypted = 0x12,
}

impl MessageKind {
    /// Parse a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::KeyExchange),
            0x11 => Some(Self::KeyExchangeAuth),
            0x12 => Some(Self::Encrypted),
            _ => None,
        }
    }
}

/// Key-exchange flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KxFlags {
    /// The receiver must answer even if it believes it is up to date
    pub force_reply: bool,
}

/// Public key material offered in a key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyExchange {
    /// Flags
    pub flags: KxFlags,
    /// Sender's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Sender's current ratchet public key
    pub ratchet: [u8; 32],
}

/// Responder's answer to a [`KeyExchange`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyExchangeAuth {
    /// Responder's key material
    pub kx: KeyExchange,
    /// Digest of the root key derived from both exchanges
    pub auth: [u8; 32],
}

/// Ratchet-encrypted frame.
///
/// `connection_id` is assigned when the frame is handed to a connection and
/// is not covered by the MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedFrame {
    /// Connection the frame was sent on
    pub connection_id: ConnectionId,
    /// Nonce for the header encryption
    pub header_nonce: [u8; 24],
    /// Encrypted ratchet header
    pub header: Bytes,
    /// Encrypted plaintext records
    pub ciphertext: Bytes,
    /// HMAC over nonce, header and ciphertext
    pub mac: [u8; 32],
}

/// Any message exchanged between tunnel endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    /// See [`KeyExchange`]
    KeyExchange(KeyExchange),
    /// See [`KeyExchangeAuth`]
    KeyExchangeAuth(KeyExchangeAuth),
    /// See [`EncryptedFrame`]
    Encrypted(EncryptedFrame),
}

impl TunnelMessage {
    /// Kind byte for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::KeyExchange(_) => MessageKind::KeyExchange,
            Self::KeyExchangeAuth(_) => MessageKind::KeyExchangeAuth,
            Self::Encrypted(_) => MessageKind::Encrypted,
        }
    }

    /// Encode to a new buffer.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    /// - `ProtocolError::MessageTooLarge` if the result exceeds
    ///   [`MAX_MESSAGE_SIZE`]
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        buf.put_u8(self.kind() as u8);
        match self {
            Self::KeyExchange(inner) => ciborium::ser::into_writer(inner, &mut buf),
            Self::KeyExchangeAuth(inner) => ciborium::ser::into_writer(inner, &mut buf),
            Self::Encrypted(inner) => ciborium::ser::into_writer(inner, &mut buf),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: buf.len(), max: MAX_MESSAGE_SIZE });
        }
        Ok(Bytes::from(buf))
    }

    /// Decode a complete message.
    ///
    /// The size check happens before any CBOR parsing.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MessageTooLarge` if `bytes` exceeds
    ///   [`MAX_MESSAGE_SIZE`]
    /// - `ProtocolError::Truncated` if `bytes` is empty
    /// - `ProtocolError::UnknownKind` for an unrecognized kind byte
    /// - `ProtocolError::CborDecode` if the body is malformed
    /// - `ProtocolError::TrailingBytes` if bytes remain after the body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }
        let Some((&kind_byte, mut body)) = bytes.split_first() else {
            return Err(ProtocolError::Truncated { needed: 1, available: 0 });
        };
        let kind = MessageKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

        let message = match kind {
            MessageKind::KeyExchange => Self::KeyExchange(
                ciborium::de::from_reader(&mut body)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            MessageKind::KeyExchangeAuth => Self::KeyExchangeAuth(
                ciborium::de::from_reader(&mut body)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            MessageKind::Encrypted => Self::Encrypted(
                ciborium::de::from_reader(&mut body)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
        };

        if !body.is_empty() {
            return Err(ProtocolError::TrailingBytes(body.len()));
        }
        Ok(message)
    }
}
