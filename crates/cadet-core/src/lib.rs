//! CADET tunnel and channel core
//!
//! Sans-IO state machines for end-to-end tunnels between two peers and the
//! channels multiplexed over them. Nothing here opens sockets, reads clocks
//! or spawns tasks: every entry point takes `now` and returns actions for the
//! caller to execute, which makes the whole layer deterministic under a
//! simulated environment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────── Service ───────────────────────────┐
//! │  open ports                    tunnels by peer                │
//! │                  ┌──────────────── Tunnel ─────────────────┐  │
//! │                  │ KxMachine   ConnectionSet   SendQueue   │  │
//! │                  │   │ verified / unverified / pending     │  │
//! │                  │   ▼                                     │  │
//! │                  │ RatchetState (cadet-crypto)             │  │
//! │                  │                                         │  │
//! │                  │ Channel  Channel  Channel ...           │  │
//! │                  │ TimerQueue (retries, keepalive, idle)   │  │
//! │                  └─────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//!          ▲ application calls              │ ServiceAction
//!          │ transport events               ▼ Transmit / Event / ...
//! ```
//!
//! # Guarantees
//!
//! - Plaintext never leaves a tunnel before its key exchange is
//!   authenticated
//! - Reliable channels deliver every payload exactly once; in-order channels
//!   deliver in sequence
//! - At most `max_pending` payloads per channel await acknowledgment
//! - Hostile or malformed traffic is dropped and counted, never fatal

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod connection;
pub mod env;
pub mod error;
pub mod kx;
pub mod ports;
pub mod queue;
pub mod rtt;
pub mod service;
pub mod timer;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use channel::{
    Channel, ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, CloseReason, Credit,
};
pub use env::{Environment, Timestamp};
pub use error::{SendRefused, ServiceError, TunnelError};
pub use kx::{KeyExchangeConfig, KxState};
pub use ports::{ListenerId, OpenPorts, PortLookup};
pub use service::{Service, ServiceAction, ServiceConfig};
pub use tunnel::{Tunnel, TunnelAction, TunnelConfig, TunnelStats};
