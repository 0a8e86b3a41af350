//! Ratchet header: the per-message metadata the receiver needs to pick a key.
//!
//! Encoded as a fixed 40-byte big-endian record and always sent encrypted
//! under the sender's header key.

use crate::error::RatchetError;

/// Encoded header length.
pub const HEADER_SIZE: usize = 40;

/// Plaintext ratchet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Position of this message in the current sending chain
    pub ns: u32,
    /// Length of the previous sending chain
    pub pns: u32,
    /// Sender's current ratchet public key
    pub dhr: [u8; 32],
}

impl RatchetHeader {
    /// Encode into the fixed wire layout.
    ///
    /// Layout: `[ns:4][pns:4][dhr:32]`
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.ns.to_be_bytes());
        buf[4..8].copy_from_slice(&self.pns.to_be_bytes());
        buf[8..40].copy_from_slice(&self.dhr);
        buf
    }

    /// Decode from the fixed wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        let Ok(bytes) = <&[u8; HEADER_SIZE]>::try_from(bytes) else {
            return Err(RatchetError::MalformedHeader { len: bytes.len() });
        };

        let mut ns = [0u8; 4];
        let mut pns = [0u8; 4];
        let mut dhr = [0u8; 32];
        ns.copy_from_slice(&bytes[0..4]);
        pns.copy_from_slice(&bytes[4..8]);
        dhr.copy_from_slice(&bytes[8..40]);

        Ok(Self { ns: u32::from_be_bytes(ns), pns: u32::from_be_bytes(pns), dhr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_big_endian() {
        let header = RatchetHeader { ns: 1, pns: 0x0102_0304, dhr: [9u8; 32] };
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(RatchetHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_wrong_length() {
        let result = RatchetHeader::from_bytes(&[0u8; 39]);
        assert_eq!(result, Err(RatchetError::MalformedHeader { len: 39 }));
    }
}
