//! Deterministic simulation harness for CADET tunnels.
//!
//! Runs any number of [`cadet_core::Service`]s over a simulated network with
//! a shared virtual clock and seeded randomness, so every scenario replays
//! exactly from its seed.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold at every step
//! of a run (window bounds, exactly-once delivery, ordering) against a
//! [`NetworkSnapshot`]. Use [`InvariantRegistry::standard()`] for all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod network;
pub mod sim_env;

pub use invariants::{
    ChannelSnapshot, InOrderPrefix, Invariant, InvariantRegistry, InvariantResult,
    NetworkSnapshot, NoDuplicateDelivery, StreamSnapshot, Violation, WindowRespected,
};
pub use network::{
    DeliveryLedger, HeldMessage, NetworkConfig, NetworkStats, Node, SimNetwork,
};
pub use sim_env::{SimClock, SimEnv, SimInstant};
