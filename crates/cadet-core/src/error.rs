//! Error types for the tunnel and channel layers.
//!
//! Errors on received traffic are absorbed by the tunnel: they are logged,
//! counted in [`TunnelStats`](crate::TunnelStats) and the offending frame is
//! dropped. Only local API calls surface errors to the caller.

use cadet_crypto::RatchetError;
use cadet_proto::{ChannelNumber, PeerId, ProtocolError};
use thiserror::Error;

use crate::channel::ChannelHandle;

/// Failure while processing tunnel traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// A frame failed MAC verification under every candidate key
    #[error("authentication failure")]
    AuthFailure,

    /// The peer sent something the protocol forbids
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was wrong
        reason: String,
    },

    /// A configured limit was hit
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Which limit
        reason: String,
    },

    /// Key exchange has not completed
    #[error("tunnel not ready")]
    NotReady,

    /// Wire decoding failed
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// Ratchet rejected the operation
    #[error("crypto error: {0}")]
    Crypto(#[from] RatchetError),
}

impl TunnelError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Authentication failures are transient: a frame may simply have been
    /// encrypted under keys from an exchange we have not finished yet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure
                | Self::NotReady
                | Self::Crypto(RatchetError::AuthFailure | RatchetError::Uninitialized)
        )
    }
}

/// Why a channel refused a send request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRefused {
    /// The channel is not open and its early-data allowance is used up
    #[error("channel not ready")]
    NotReady,

    /// The window of unacknowledged messages is full
    #[error("window full ({in_flight}/{max})")]
    WindowFull {
        /// Messages awaiting acknowledgment
        in_flight: u32,
        /// Window size
        max: u32,
    },

    /// The channel is being torn down
    #[error("channel is being destroyed")]
    Destroying,

    /// The payload does not fit a single frame
    #[error("payload too large ({size} > {max} bytes)")]
    PayloadTooLarge {
        /// Payload length
        size: usize,
        /// Largest accepted payload
        max: usize,
    },

    /// No such channel
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelNumber),
}

impl SendRefused {
    /// Whether the send may succeed later once credit is returned.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady | Self::WindowFull { .. })
    }
}

/// Errors from the application-facing [`Service`](crate::Service) API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The handle does not name a live channel
    #[error("unknown channel {0:?}")]
    UnknownChannel(ChannelHandle),

    /// No tunnel toward this peer exists
    #[error("no tunnel to {0}")]
    UnknownPeer(PeerId),

    /// A listener is already registered for this port
    #[error("port already open")]
    PortAlreadyOpen,

    /// No listener is registered for this port
    #[error("port not open")]
    PortNotOpen,

    /// A tunnel toward our own identity was requested
    #[error("refusing tunnel to self ({0})")]
    SelfTunnel(PeerId),

    /// Tunnel-level failure
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}
