//! Invariant checking for deterministic simulation runs.
//!
//! A [`NetworkSnapshot`] captures the observable channel state of every node
//! together with the delivery ledger, and each [`Invariant`] checks one
//! property against it. Tests take snapshots at arbitrary points of a run,
//! so invariants only state what holds at every step, never what holds once
//! the network has settled.

use std::collections::BTreeMap;

use bytes::Bytes;
use cadet_core::ChannelState;
use cadet_proto::{ChannelNumber, ChannelOptions, PeerId};

use crate::network::SimNetwork;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// One channel end as seen by its node.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Node holding this end
    pub node: PeerId,
    /// Remote end of the tunnel
    pub peer: PeerId,
    /// Channel number
    pub ctn: ChannelNumber,
    /// Options negotiated at open
    pub options: ChannelOptions,
    /// Lifecycle state
    pub state: ChannelState,
    /// Payloads awaiting acknowledgment
    pub pending: u32,
    /// Window size
    pub max_pending: u32,
}

/// Payloads of one direction of one channel.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    /// Sender
    pub from: PeerId,
    /// Receiver
    pub to: PeerId,
    /// Channel number
    pub ctn: ChannelNumber,
    /// Options of the sending end, if it still exists
    pub options: Option<ChannelOptions>,
    /// Payloads accepted by `send`, in order
    pub sent: Vec<Bytes>,
    /// Payloads delivered to the receiver, in order
    pub delivered: Vec<Bytes>,
}

/// Observable state of a whole network.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    /// Every live channel end
    pub channels: Vec<ChannelSnapshot>,
    /// Every stream that carried payloads
    pub streams: Vec<StreamSnapshot>,
}

impl NetworkSnapshot {
    /// Capture `network`.
    pub fn capture(network: &SimNetwork) -> Self {
        let mut channels = Vec::new();
        for node in network.node_ids() {
            let Some(service) = network.node(&node).map(crate::network::Node::service) else {
                continue;
            };
            for peer in network.node_ids() {
                let Some(tunnel) = service.tunnel(&peer) else { continue };
                channels.extend(tunnel.channels().map(|channel| ChannelSnapshot {
                    node,
                    peer,
                    ctn: channel.ctn(),
                    options: channel.options(),
                    state: channel.state(),
                    pending: channel.pending_messages(),
                    max_pending: channel.max_pending(),
                }));
            }
        }

        let ledger = network.ledger();
        let streams = ledger
            .streams()
            .into_iter()
            .map(|(from, to, ctn)| StreamSnapshot {
                from,
                to,
                ctn,
                options: channels
                    .iter()
                    .find(|c| c.node == from && c.peer == to && c.ctn == ctn)
                    .map(|c| c.options),
                sent: ledger.sent(from, to, ctn).to_vec(),
                delivered: ledger.delivered(from, to, ctn).to_vec(),
            })
            .collect();

        Self { channels, streams }
    }
}

/// A property that holds at every step of a run.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against `state`.
    fn check(&self, state: &NetworkSnapshot) -> InvariantResult;
}

/// No channel holds more unacknowledged payloads than its window.
#[derive(Debug, Clone, Copy)]
pub struct WindowRespected;

impl Invariant for WindowRespected {
    fn name(&self) -> &'static str {
        "window_respected"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        for channel in &state.channels {
            if channel.pending > channel.max_pending {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{} -> {} channel {}: {} pending, window {}",
                        channel.node, channel.peer, channel.ctn, channel.pending, channel.max_pending
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Reliable channels never deliver a payload more often than it was sent.
#[derive(Debug, Clone, Copy)]
pub struct NoDuplicateDelivery;

impl Invariant for NoDuplicateDelivery {
    fn name(&self) -> &'static str {
        "no_duplicate_delivery"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        for stream in state.streams.iter().filter(|s| s.options.is_none_or(|o| o.reliable)) {
            let mut balance: BTreeMap<&Bytes, i64> = BTreeMap::new();
            for payload in &stream.sent {
                *balance.entry(payload).or_default() += 1;
            }
            for payload in &stream.delivered {
                let count = balance.entry(payload).or_default();
                *count -= 1;
                if *count < 0 {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{} -> {} channel {}: {payload:?} delivered more often than sent",
                            stream.from, stream.to, stream.ctn
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Reliable in-order channels deliver a prefix of what was sent.
#[derive(Debug, Clone, Copy)]
pub struct InOrderPrefix;

impl Invariant for InOrderPrefix {
    fn name(&self) -> &'static str {
        "in_order_prefix"
    }

    fn check(&self, state: &NetworkSnapshot) -> InvariantResult {
        let in_order = |o: ChannelOptions| o.reliable && !o.out_of_order;
        for stream in state.streams.iter().filter(|s| s.options.is_some_and(in_order)) {
            if !stream.sent.starts_with(&stream.delivered) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{} -> {} channel {}: delivered {} payloads out of order",
                        stream.from,
                        stream.to,
                        stream.ctn,
                        stream.delivered.len()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every channel invariant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(WindowRespected);
        registry.add(NoDuplicateDelivery);
        registry.add(InOrderPrefix);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, collecting every violation.
    pub fn check_all(&self, state: &NetworkSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
