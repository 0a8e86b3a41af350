//! Simulated network of CADET services.
//!
//! [`SimNetwork`] owns one [`Service`] per node and plays the transport
//! driver for all of them: it turns `RequestConnection` into connections,
//! carries `Transmit` bytes with configurable latency, jitter, loss and
//! duplication, and fires service timers on a shared virtual clock. Nothing
//! depends on wall time, so a run is reproducible from its seed.
//!
//! Besides random faults the network can block a direction outright or hold
//! its messages for the test to release in any order.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use cadet_core::{
    ChannelEvent, ChannelHandle, Credit, SendRefused, Service, ServiceAction, ServiceConfig,
    ServiceError,
};
use cadet_crypto::IdentityKeyPair;
use cadet_proto::{ChannelNumber, ChannelOptions, ConnectionId, PeerId};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::sim_env::{SimClock, SimEnv, SimInstant};

/// Upper bound on events processed by one `run_until`.
const MAX_STEPS: usize = 1_000_000;

/// Fault profile applied to every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base one-way delay
    pub latency: Duration,
    /// Extra random delay, uniform in `0..=jitter`
    pub jitter: Duration,
    /// Chance in percent that a message is lost
    pub loss_percent: u8,
    /// Chance in percent that a message arrives twice
    pub duplicate_percent: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            jitter: Duration::ZERO,
            loss_percent: 0,
            duplicate_percent: 0,
        }
    }
}

impl NetworkConfig {
    /// Perfect network with `latency`.
    pub fn reliable(latency: Duration) -> Self {
        Self { latency, ..Self::default() }
    }

    /// Lossy, reordering network.
    pub fn lossy(loss_percent: u8, duplicate_percent: u8) -> Self {
        Self {
            latency: Duration::from_millis(20),
            jitter: Duration::from_millis(30),
            loss_percent,
            duplicate_percent,
        }
    }
}

/// Message captured on a held direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldMessage {
    /// Sender
    pub from: PeerId,
    /// Receiver
    pub to: PeerId,
    /// Connection it was sent on
    pub connection: ConnectionId,
    /// Encoded tunnel message
    pub bytes: Bytes,
}

/// Counters for what the network did with transmitted messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Messages handed to the network
    pub transmitted: u64,
    /// Messages handed to a receiving service
    pub delivered: u64,
    /// Messages lost to random loss or a blocked direction
    pub dropped: u64,
    /// Extra copies injected
    pub duplicated: u64,
    /// Messages captured on a held direction
    pub held: u64,
}

/// Payloads submitted and delivered, keyed by `(sender, receiver, channel)`.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLedger {
    sent: BTreeMap<(PeerId, PeerId, ChannelNumber), Vec<Bytes>>,
    delivered: BTreeMap<(PeerId, PeerId, ChannelNumber), Vec<Bytes>>,
}

impl DeliveryLedger {
    /// Payloads `from` submitted on `ctn` toward `to`.
    pub fn sent(&self, from: PeerId, to: PeerId, ctn: ChannelNumber) -> &[Bytes] {
        self.sent.get(&(from, to, ctn)).map_or(&[], Vec::as_slice)
    }

    /// Payloads `to` received on `ctn` from `from`, in delivery order.
    pub fn delivered(&self, from: PeerId, to: PeerId, ctn: ChannelNumber) -> &[Bytes] {
        self.delivered.get(&(from, to, ctn)).map_or(&[], Vec::as_slice)
    }

    /// Every stream that carried at least one payload.
    pub fn streams(&self) -> BTreeSet<(PeerId, PeerId, ChannelNumber)> {
        self.sent.keys().chain(self.delivered.keys()).copied().collect()
    }
}

/// One simulated peer.
pub struct Node {
    secret: [u8; 32],
    service: Service<SimEnv>,
    events: Vec<ChannelEvent>,
    stalled: Vec<PeerId>,
    destroyed: Vec<PeerId>,
    auto_ack: bool,
    restarts: u32,
}

impl Node {
    /// The node's service.
    pub fn service(&self) -> &Service<SimEnv> {
        &self.service
    }

    /// Application events seen so far.
    pub fn events(&self) -> &[ChannelEvent] {
        &self.events
    }

    /// Drain the recorded events.
    pub fn take_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Payloads delivered on `handle`, in order.
    pub fn payloads(&self, handle: ChannelHandle) -> Vec<Bytes> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Data { handle: h, payload } if *h == handle => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Peers whose key exchange was reported stalled.
    pub fn stalled(&self) -> &[PeerId] {
        &self.stalled
    }

    /// Peers whose tunnel was destroyed.
    pub fn destroyed_tunnels(&self) -> &[PeerId] {
        &self.destroyed
    }

    /// Times the node was restarted.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

#[derive(Debug, Clone)]
enum NetEvent {
    Deliver { from: PeerId, to: PeerId, connection: ConnectionId, bytes: Bytes },
    Ready { node: PeerId, peer: PeerId, connection: ConnectionId },
}

/// Deterministic network of services sharing one virtual clock.
pub struct SimNetwork {
    clock: SimClock,
    rng: ChaCha8Rng,
    config: NetworkConfig,
    service_config: ServiceConfig,
    nodes: BTreeMap<PeerId, Node>,
    pending: BTreeMap<(SimInstant, u64), NetEvent>,
    seq: u64,
    links: BTreeMap<(PeerId, PeerId), ConnectionId>,
    attached: BTreeSet<(PeerId, ConnectionId)>,
    next_connection: u64,
    blocked: BTreeSet<(PeerId, PeerId)>,
    held_directions: BTreeSet<(PeerId, PeerId)>,
    held: Vec<HeldMessage>,
    ledger: DeliveryLedger,
    stats: NetworkStats,
}

impl SimNetwork {
    /// Empty network.
    pub fn new(seed: u64, config: NetworkConfig, service_config: ServiceConfig) -> Self {
        Self {
            clock: SimClock::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
            service_config,
            nodes: BTreeMap::new(),
            pending: BTreeMap::new(),
            seq: 0,
            links: BTreeMap::new(),
            attached: BTreeSet::new(),
            next_connection: 1,
            blocked: BTreeSet::new(),
            held_directions: BTreeSet::new(),
            held: Vec::new(),
            ledger: DeliveryLedger::default(),
            stats: NetworkStats::default(),
        }
    }

    /// Add a node whose identity is derived from `secret`.
    ///
    /// Received payloads are acknowledged automatically unless disabled
    /// with [`SimNetwork::set_auto_ack`].
    pub fn add_node(&mut self, secret: u8) -> PeerId {
        let secret = [secret; 32];
        let service = self.spawn_service(secret);
        let peer = service.local_peer();
        self.nodes.insert(
            peer,
            Node {
                secret,
                service,
                events: Vec::new(),
                stalled: Vec::new(),
                destroyed: Vec::new(),
                auto_ack: true,
                restarts: 0,
            },
        );
        peer
    }

    /// Current virtual time.
    pub fn now(&self) -> SimInstant {
        self.clock.now()
    }

    /// Node by identity.
    pub fn node(&self, peer: &PeerId) -> Option<&Node> {
        self.nodes.get(peer)
    }

    /// Identities of all nodes.
    pub fn node_ids(&self) -> Vec<PeerId> {
        self.nodes.keys().copied().collect()
    }

    /// Mutable node by identity.
    pub fn node_mut(&mut self, peer: &PeerId) -> Option<&mut Node> {
        self.nodes.get_mut(peer)
    }

    /// Traffic counters.
    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Submitted and delivered payloads.
    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    /// Whether `node` acknowledges delivered payloads on its own.
    pub fn set_auto_ack(&mut self, node: PeerId, enabled: bool) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.auto_ack = enabled;
        }
    }

    /// Listen on `port` at `node`.
    pub fn accept(&mut self, node: PeerId, port: &[u8]) -> Result<(), ServiceError> {
        let now = self.now();
        let actions = self.service_mut(node)?.accept(port, now)?;
        self.apply(node, actions);
        Ok(())
    }

    /// Stop listening on `port` at `node`.
    pub fn close_port(&mut self, node: PeerId, port: &[u8]) -> Result<(), ServiceError> {
        self.service_mut(node)?.close_port(port)
    }

    /// Open a channel from `node` to `port` on `dest`.
    pub fn open(
        &mut self,
        node: PeerId,
        dest: PeerId,
        port: &[u8],
        options: ChannelOptions,
    ) -> Result<ChannelHandle, ServiceError> {
        let now = self.now();
        let (handle, actions) = self.service_mut(node)?.open(dest, port, options, now)?;
        self.apply(node, actions);
        Ok(handle)
    }

    /// Submit `payload` on `handle` at `node`.
    pub fn send(
        &mut self,
        node: PeerId,
        handle: ChannelHandle,
        payload: Bytes,
    ) -> Result<Credit, SendRefused> {
        let now = self.now();
        let Some(n) = self.nodes.get_mut(&node) else {
            return Err(SendRefused::UnknownChannel(handle.ctn));
        };
        let (credit, actions) = n.service.send(handle, payload.clone(), now)?;
        self.ledger.sent.entry((node, handle.peer, handle.ctn)).or_default().push(payload);
        self.apply(node, actions);
        Ok(credit)
    }

    /// Let `node` take the next payload on `handle`.
    pub fn acknowledge(&mut self, node: PeerId, handle: ChannelHandle) -> Result<(), ServiceError> {
        let now = self.now();
        let actions = self.service_mut(node)?.acknowledge_received(handle, now)?;
        self.apply(node, actions);
        Ok(())
    }

    /// Destroy `handle` at `node`.
    pub fn destroy(&mut self, node: PeerId, handle: ChannelHandle) -> Result<(), ServiceError> {
        let now = self.now();
        let actions = self.service_mut(node)?.destroy(handle, now)?;
        self.apply(node, actions);
        Ok(())
    }

    /// Re-key the tunnel from `node` to `peer`.
    pub fn rekey(&mut self, node: PeerId, peer: PeerId) -> Result<(), ServiceError> {
        let now = self.now();
        let actions = self.service_mut(node)?.rekey(peer, now)?;
        self.apply(node, actions);
        Ok(())
    }

    /// Drop everything `from` sends to `to` until unblocked.
    pub fn block(&mut self, from: PeerId, to: PeerId) {
        self.blocked.insert((from, to));
    }

    /// Undo [`SimNetwork::block`].
    pub fn unblock(&mut self, from: PeerId, to: PeerId) {
        self.blocked.remove(&(from, to));
    }

    /// Capture everything `from` sends to `to` until released.
    pub fn hold(&mut self, from: PeerId, to: PeerId) {
        self.held_directions.insert((from, to));
    }

    /// Messages captured so far, oldest first.
    pub fn held(&self) -> &[HeldMessage] {
        &self.held
    }

    /// Stop capturing `from -> to`. Already captured messages stay held.
    pub fn stop_holding(&mut self, from: PeerId, to: PeerId) {
        self.held_directions.remove(&(from, to));
    }

    /// Deliver captured messages right now, in the order of `indices`.
    ///
    /// Indices refer to [`SimNetwork::held`]; the rest stay captured.
    pub fn release(&mut self, indices: &[usize]) {
        let mut slots: Vec<Option<HeldMessage>> = self.held.drain(..).map(Some).collect();
        let mut released = Vec::with_capacity(indices.len());
        for &index in indices {
            if let Some(message) = slots.get_mut(index).and_then(Option::take) {
                released.push(message);
            }
        }
        self.held = slots.into_iter().flatten().collect();
        for message in released {
            self.deliver(message.from, message.to, message.connection, &message.bytes);
        }
    }

    /// Replace `node`'s service with a fresh one holding the same identity.
    ///
    /// All tunnel and channel state is lost; connections stay up.
    pub fn restart(&mut self, node: PeerId) {
        let Some(secret) = self.nodes.get(&node).map(|n| n.secret) else {
            return;
        };
        let service = self.spawn_service(secret);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.service = service;
            n.restarts += 1;
        }
        debug!(%node, "node restarted");

        let links: Vec<((PeerId, PeerId), ConnectionId)> = self
            .links
            .iter()
            .filter(|(_, id)| self.attached.contains(&(node, **id)))
            .map(|(pair, id)| (*pair, *id))
            .collect();
        let now = self.now();
        for ((a, b), connection) in links {
            let peer = if a == node { b } else { a };
            self.schedule(now, NetEvent::Ready { node, peer, connection });
        }
    }

    /// Process events and timers up to and including `deadline`.
    pub fn run_until(&mut self, deadline: SimInstant) {
        for _ in 0..MAX_STEPS {
            let next_event = self.pending.keys().next().map(|(at, _)| *at);
            let next_timer = self.nodes.values().filter_map(|n| n.service.next_deadline()).min();
            let next = match (next_event, next_timer) {
                (Some(e), Some(t)) => e.min(t),
                (Some(e), None) => e,
                (None, Some(t)) => t,
                (None, None) => break,
            };
            if next > deadline {
                break;
            }
            self.clock.advance_to(next);

            if next_event == Some(next) {
                if let Some((_, event)) = self.pending.pop_first() {
                    self.handle(event);
                }
            } else {
                self.fire_timers();
            }
        }
        self.clock.advance_to(deadline);
    }

    /// Run for `duration` of virtual time.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.run_until(deadline);
    }

    fn spawn_service(&mut self, secret: [u8; 32]) -> Service<SimEnv> {
        let identity = Arc::new(IdentityKeyPair::from_secret_bytes(secret));
        let env = SimEnv::with_clock(self.clock.clone(), self.rng.next_u64());
        Service::new(identity, env, self.service_config.clone())
    }

    fn service_mut(&mut self, node: PeerId) -> Result<&mut Service<SimEnv>, ServiceError> {
        self.nodes.get_mut(&node).map(|n| &mut n.service).ok_or(ServiceError::UnknownPeer(node))
    }

    fn schedule(&mut self, at: SimInstant, event: NetEvent) {
        self.seq += 1;
        self.pending.insert((at, self.seq), event);
    }

    fn fire_timers(&mut self) {
        let now = self.now();
        let due: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.service.next_deadline().is_some_and(|at| at <= now))
            .map(|(peer, _)| *peer)
            .collect();
        for node in due {
            if let Some(n) = self.nodes.get_mut(&node) {
                let actions = n.service.poll_timers(now);
                self.apply(node, actions);
            }
        }
    }

    fn handle(&mut self, event: NetEvent) {
        match event {
            NetEvent::Deliver { from, to, connection, bytes } => {
                self.deliver(from, to, connection, &bytes);
            },
            NetEvent::Ready { node, peer, connection } => {
                let now = self.now();
                let Some(n) = self.nodes.get_mut(&node) else { return };
                match n.service.on_connection_ready(peer, connection, now) {
                    Ok(actions) => self.apply(node, actions),
                    Err(error) => warn!(%node, %peer, %error, "connection ready refused"),
                }
            },
        }
    }

    /// Hand `bytes` to `to`. The first message on a connection also makes
    /// the connection usable from the receiving end.
    fn deliver(&mut self, from: PeerId, to: PeerId, connection: ConnectionId, bytes: &[u8]) {
        let now = self.now();
        let Some(n) = self.nodes.get_mut(&to) else { return };
        self.stats.delivered += 1;
        let mut actions = n.service.on_message_received(from, connection, bytes, now);
        if self.attached.insert((to, connection)) {
            match n.service.on_connection_ready(from, connection, now) {
                Ok(more) => actions.extend(more),
                Err(error) => warn!(node = %to, peer = %from, %error, "connection ready refused"),
            }
        }
        self.apply(to, actions);
    }

    /// Execute service actions, including any that acknowledging produces.
    fn apply(&mut self, node: PeerId, actions: Vec<ServiceAction>) {
        let mut work = VecDeque::from([(node, actions)]);
        while let Some((node, actions)) = work.pop_front() {
            for action in actions {
                match action {
                    ServiceAction::Transmit { peer, connection, bytes } => {
                        self.transmit(node, peer, connection, bytes);
                    },
                    ServiceAction::RequestConnection { peer } => self.connect(node, peer),
                    ServiceAction::Event(event) => {
                        if let Some(more) = self.record_event(node, event) {
                            work.push_back((node, more));
                        }
                    },
                    ServiceAction::KeyExchangeStalled { peer } => {
                        if let Some(n) = self.nodes.get_mut(&node) {
                            n.stalled.push(peer);
                        }
                    },
                    ServiceAction::TunnelDestroyed { peer } => {
                        if let Some(n) = self.nodes.get_mut(&node) {
                            n.destroyed.push(peer);
                        }
                    },
                }
            }
        }
    }

    fn record_event(&mut self, node: PeerId, event: ChannelEvent) -> Option<Vec<ServiceAction>> {
        let now = self.now();
        let n = self.nodes.get_mut(&node)?;
        let ack = match &event {
            ChannelEvent::Data { handle, payload } => {
                self.ledger
                    .delivered
                    .entry((handle.peer, node, handle.ctn))
                    .or_default()
                    .push(payload.clone());
                n.auto_ack.then_some(*handle)
            },
            _ => None,
        };
        n.events.push(event);

        let handle = ack?;
        n.service.acknowledge_received(handle, now).ok()
    }

    fn transmit(&mut self, from: PeerId, to: PeerId, connection: ConnectionId, bytes: Bytes) {
        let now = self.now();
        self.stats.transmitted += 1;
        // The connection takes the next message once this one is handed off.
        self.schedule(now, NetEvent::Ready { node: from, peer: to, connection });

        if self.blocked.contains(&(from, to)) {
            trace!(%from, %to, "blocked");
            self.stats.dropped += 1;
            return;
        }
        if self.held_directions.contains(&(from, to)) {
            self.stats.held += 1;
            self.held.push(HeldMessage { from, to, connection, bytes });
            return;
        }
        if self.roll(self.config.loss_percent) {
            trace!(%from, %to, "lost");
            self.stats.dropped += 1;
            return;
        }

        let copies = if self.roll(self.config.duplicate_percent) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };
        for _ in 0..copies {
            let at = now + self.delay();
            self.schedule(at, NetEvent::Deliver { from, to, connection, bytes: bytes.clone() });
        }
    }

    fn connect(&mut self, node: PeerId, peer: PeerId) {
        if !self.nodes.contains_key(&peer) {
            warn!(%node, %peer, "connection requested to unknown node");
            return;
        }
        let key = if node < peer { (node, peer) } else { (peer, node) };
        let at = self.now() + self.config.latency;
        let connection = if let Some(id) = self.links.get(&key) {
            *id
        } else {
            let id = ConnectionId(self.next_connection);
            self.next_connection += 1;
            self.links.insert(key, id);
            debug!(%node, %peer, %id, "connection established");
            id
        };
        self.attached.insert((node, connection));
        self.schedule(at, NetEvent::Ready { node, peer, connection });
    }

    fn roll(&mut self, percent: u8) -> bool {
        percent > 0 && self.rng.gen_range(0..100u8) < percent
    }

    fn delay(&mut self) -> Duration {
        let jitter = self.config.jitter.as_nanos() as u64;
        if jitter == 0 {
            return self.config.latency;
        }
        self.config.latency + Duration::from_nanos(self.rng.gen_range(0..=jitter))
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("now", &self.now())
            .field("nodes", &self.nodes.len())
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
