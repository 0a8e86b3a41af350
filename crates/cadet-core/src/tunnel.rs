//! Tunnel dispatcher.
//!
//! A [`Tunnel`] is the end-to-end session with one peer. It owns the
//! key-exchange machine, the channels multiplexed over the tunnel, the queue
//! of plaintext records waiting for a connection, and every timer of the
//! above. Like the other machines in this crate it performs no I/O: each
//! entry point takes the current time and returns [`TunnelAction`]s for the
//! driver.
//!
//! # Data Flow
//!
//! ```text
//!            outbound                                inbound
//!  channel ──> SendQueue ──(ready conn)──> seal     bytes ──> decode
//!                                           │                   │
//!                                           ▼                   ▼
//!                                  TunnelAction::Transmit   KX / KX_AUTH ──> KxMachine
//!                                                            Encrypted ──> decrypt
//!                                                                            │
//!                                                                            ▼
//!                                                             records ──> Channel by number
//! ```
//!
//! Records are encrypted only when a connection is ready for them. A record
//! for an unknown channel is answered with `ChannelDestroy`, except a
//! `ChannelDestroy` itself.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use cadet_crypto::{IdentityKeyPair, RatchetConfig, Role};
use cadet_proto::{
    ChannelDestroy, ChannelNumber, ChannelOpen, ChannelOptions, ChannelRecord, ConnectionId,
    EncryptedFrame, PeerId, PortHash, TunnelMessage, decode_records, encode_records,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{
        Channel, ChannelConfig, ChannelEvent, ChannelHandle, ChannelIo, ChannelState,
        ChannelTimer, Credit,
    },
    connection::ConnectionSet,
    env::Environment,
    error::{SendRefused, TunnelError},
    kx::{KeyExchangeConfig, KxAction, KxMachine, KxState, Received},
    ports::PortLookup,
    queue::{QueueHandle, SendOrigin, SendQueue},
    timer::TimerQueue,
};

/// How long a tunnel without channels lingers before it is destroyed.
pub const DEFAULT_IDLE_DESTROY_DELAY: Duration = Duration::from_secs(90);

/// Silence after which a keepalive is sent on a tunnel with channels.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Lifetime of a tunnel with no channels
    pub idle_destroy_delay: Duration,
    /// Keepalive interval while channels exist
    pub keepalive_interval: Duration,
    /// Key-exchange retries and re-keying
    pub key_exchange: KeyExchangeConfig,
    /// Ratchet thresholds
    pub ratchet: RatchetConfig,
    /// Settings for every channel of the tunnel
    pub channel: ChannelConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_destroy_delay: DEFAULT_IDLE_DESTROY_DELAY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            key_exchange: KeyExchangeConfig::default(),
            ratchet: RatchetConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Timers owned by a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelTimer {
    /// Key-exchange retry
    KeyExchange,
    /// Keepalive check
    Keepalive,
    /// Destroy the tunnel if it still has no channels and nothing to send
    IdleDestroy,
    /// A channel timer
    Channel(ChannelNumber, ChannelTimer),
}

/// Actions returned to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Hand `bytes` to `connection`; it is busy until reported ready again
    Transmit {
        /// Connection to use
        connection: ConnectionId,
        /// Encoded [`TunnelMessage`]
        bytes: Bytes,
    },
    /// Traffic is waiting but no connection to the peer exists
    RequestConnection,
    /// Application event
    Event(ChannelEvent),
    /// Key-exchange retries keep going unanswered
    KeyExchangeStalled,
    /// The tunnel is gone; drop it
    Destroyed,
}

/// Counters for traffic the tunnel handled or dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Encrypted frames transmitted
    pub frames_sent: u64,
    /// Encrypted frames decrypted
    pub frames_received: u64,
    /// Frames that failed authentication
    pub auth_failures: u64,
    /// Frames dropped because keys were not yet agreed
    pub not_ready_drops: u64,
    /// Messages or records that failed to decode
    pub malformed: u64,
    /// Protocol violations by the peer
    pub violations: u64,
    /// Acks that acknowledged nothing new
    pub duplicate_acks: u64,
    /// Keepalives transmitted
    pub keepalives_sent: u64,
    /// Keepalives received
    pub keepalives_received: u64,
    /// `ChannelDestroy` sent for records naming unknown channels
    pub destroys_echoed: u64,
    /// Cleartext key-exchange messages transmitted
    pub kx_sent: u64,
}

/// Glue handing a channel the tunnel's queue, timers and action list.
struct TunnelIo<'a, I> {
    ctn: ChannelNumber,
    queue: &'a mut SendQueue,
    timers: &'a mut TimerQueue<I, TunnelTimer>,
    actions: &'a mut Vec<TunnelAction>,
}

impl<I: Ord + Copy> ChannelIo<I> for TunnelIo<'_, I> {
    fn send(&mut self, record: ChannelRecord, origin: SendOrigin) -> QueueHandle {
        self.queue.push(record, origin)
    }

    fn cancel(&mut self, handle: QueueHandle) {
        self.queue.cancel(handle);
    }

    fn schedule(&mut self, timer: ChannelTimer, at: I) {
        self.timers.schedule(TunnelTimer::Channel(self.ctn, timer), at);
    }

    fn cancel_timer(&mut self, timer: ChannelTimer) {
        self.timers.cancel(&TunnelTimer::Channel(self.ctn, timer));
    }

    fn emit(&mut self, event: ChannelEvent) {
        self.actions.push(TunnelAction::Event(event));
    }
}

type Instant<E> = <E as Environment>::Instant;

/// End-to-end session with one peer.
pub struct Tunnel<E: Environment> {
    local: PeerId,
    peer: PeerId,
    env: E,
    config: TunnelConfig,
    kx: KxMachine<Instant<E>>,
    connections: ConnectionSet,
    channels: BTreeMap<ChannelNumber, Channel<Instant<E>>>,
    queue: SendQueue,
    timers: TimerQueue<Instant<E>, TunnelTimer>,
    /// Latest cleartext key-exchange message; superseded ones are dropped
    kx_outbox: Option<TunnelMessage>,
    next_ctn: u32,
    last_sent: Option<Instant<E>>,
    frames_since_rekey: u64,
    connection_requested: bool,
    destroyed: bool,
    stats: TunnelStats,
}

impl<E: Environment> Tunnel<E> {
    /// Tunnel toward `peer`.
    ///
    /// # Errors
    ///
    /// - `TunnelError::Crypto(SelfKeyExchange)` if `peer` is our identity
    pub fn new(
        identity: Arc<IdentityKeyPair>,
        peer: PeerId,
        env: E,
        config: TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let local = PeerId(identity.public_bytes());
        let kx = KxMachine::new(
            identity,
            peer,
            config.key_exchange.clone(),
            config.ratchet.clone(),
            &env,
        )?;
        debug!(%peer, role = ?kx.role(), "tunnel created");

        Ok(Self {
            local,
            peer,
            env,
            config,
            kx,
            connections: ConnectionSet::new(),
            channels: BTreeMap::new(),
            queue: SendQueue::new(),
            timers: TimerQueue::new(),
            kx_outbox: None,
            next_ctn: 0,
            last_sent: None,
            frames_since_rekey: 0,
            connection_requested: false,
            destroyed: false,
            stats: TunnelStats::default(),
        })
    }

    /// Remote end.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Our role in the key exchange.
    pub fn role(&self) -> Role {
        self.kx.role()
    }

    /// Key-exchange state.
    pub fn kx_state(&self) -> KxState {
        self.kx.state()
    }

    /// The key-exchange machine, for inspection.
    pub fn key_exchange(&self) -> &KxMachine<Instant<E>> {
        &self.kx
    }

    /// Traffic counters.
    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// Channel by number.
    pub fn channel(&self, ctn: ChannelNumber) -> Option<&Channel<Instant<E>>> {
        self.channels.get(&ctn)
    }

    /// Live channels.
    pub fn channels(&self) -> impl Iterator<Item = &Channel<Instant<E>>> {
        self.channels.values()
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Records waiting for a connection.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Known connections, ready or busy.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether [`TunnelAction::Destroyed`] was emitted.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant<E>> {
        self.timers.next_deadline()
    }

    /// Open a channel toward `port` on the peer.
    ///
    /// The number comes from our half of the channel-number space, so both
    /// ends can allocate concurrently without collisions.
    pub fn open_channel(
        &mut self,
        port: PortHash,
        options: ChannelOptions,
        now: Instant<E>,
    ) -> (ChannelNumber, Vec<TunnelAction>) {
        let mut actions = Vec::new();
        let ctn = self.allocate_ctn();
        let handle = ChannelHandle { peer: self.peer, ctn };
        let channel = Channel::outbound(handle, port, options, self.config.channel.clone());
        self.channels.insert(ctn, channel);
        self.timers.cancel(&TunnelTimer::IdleDestroy);
        debug!(peer = %self.peer, %ctn, ?options, "opening channel");

        if self.kx.is_ready() {
            self.with_channel(ctn, &mut actions, |ch, io| ch.tunnel_up(io));
        } else {
            self.ensure_started(now, &mut actions);
        }
        self.flush(now, &mut actions);
        (ctn, actions)
    }

    /// Submit a payload on a channel.
    ///
    /// # Errors
    ///
    /// - `SendRefused::UnknownChannel` if `ctn` is not live
    /// - Whatever the channel refuses, see [`Channel::send`]
    pub fn send(
        &mut self,
        ctn: ChannelNumber,
        payload: Bytes,
        now: Instant<E>,
    ) -> Result<(Credit, Vec<TunnelAction>), SendRefused> {
        let mut actions = Vec::new();
        let credit = self
            .with_channel(ctn, &mut actions, |ch, io| ch.send(payload, io))
            .ok_or(SendRefused::UnknownChannel(ctn))??;
        if !self.kx.is_ready() {
            self.ensure_started(now, &mut actions);
        }
        self.flush(now, &mut actions);
        Ok((credit, actions))
    }

    /// The application consumed the last delivered payload.
    pub fn acknowledge_received(&mut self, ctn: ChannelNumber, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        self.with_channel(ctn, &mut actions, |ch, io| ch.client_ack(io));
        self.flush(now, &mut actions);
        actions
    }

    /// Destroy a channel on behalf of the application.
    pub fn destroy_channel(&mut self, ctn: ChannelNumber, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        self.with_channel(ctn, &mut actions, |ch, io| ch.local_destroy(io));
        self.reap(ctn);
        self.flush(now, &mut actions);
        self.maybe_arm_idle(now);
        actions
    }

    /// A listener appeared on `port`: bind loose channels waiting for it.
    pub fn bind_loose(&mut self, port: &PortHash, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        let waiting: Vec<ChannelNumber> = self
            .channels
            .values()
            .filter(|ch| ch.state() == ChannelState::Loose && ch.port() == *port)
            .map(Channel::ctn)
            .collect();
        for ctn in waiting {
            self.with_channel(ctn, &mut actions, |ch, io| ch.bind(io));
        }
        self.flush(now, &mut actions);
        actions
    }

    /// Queue a record outside of any channel's bookkeeping.
    ///
    /// The record is encrypted and sent in order once keys and a connection
    /// are available.
    pub fn enqueue(&mut self, record: ChannelRecord, now: Instant<E>) -> (QueueHandle, Vec<TunnelAction>) {
        let mut actions = Vec::new();
        let handle = self.queue.push(record, SendOrigin::Tunnel);
        if !self.kx.is_ready() {
            self.ensure_started(now, &mut actions);
        }
        self.flush(now, &mut actions);
        (handle, actions)
    }

    /// Withdraw a queued record. Returns whether it was still queued.
    pub fn cancel(&mut self, handle: QueueHandle) -> bool {
        self.queue.cancel(handle).is_some()
    }

    /// Start a re-key. Only the initiator re-keys.
    pub fn rekey(&mut self, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        let kx_actions = self.kx.rekey(now, &self.env);
        self.frames_since_rekey = 0;
        self.apply_kx(kx_actions, now, &mut actions);
        self.flush(now, &mut actions);
        actions
    }

    /// `connection` can take one more message.
    pub fn on_connection_ready(&mut self, connection: ConnectionId, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }
        trace!(peer = %self.peer, %connection, "connection ready");
        self.connections.mark_ready(connection);
        self.connection_requested = false;
        if self.kx.state() == KxState::Uninitialized {
            let kx_actions = self.kx.start(now);
            self.apply_kx(kx_actions, now, &mut actions);
        }
        self.flush(now, &mut actions);
        self.maybe_arm_idle(now);
        actions
    }

    /// `connection` cannot take messages for now.
    pub fn on_connection_busy(&mut self, connection: ConnectionId) {
        self.connections.mark_busy(connection);
    }

    /// `connection` is gone.
    pub fn on_connection_lost(&mut self, connection: ConnectionId) {
        debug!(peer = %self.peer, %connection, "connection lost");
        self.connections.remove(connection);
    }

    /// Bytes arrived from the peer.
    ///
    /// Malformed, unauthenticated and premature traffic is dropped and
    /// counted in [`TunnelStats`]; it never fails the tunnel.
    pub fn on_message_received(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        ports: &impl PortLookup,
        now: Instant<E>,
    ) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }

        if let Err(error) = self.process_message(bytes, ports, now, &mut actions) {
            match &error {
                TunnelError::AuthFailure => self.stats.auth_failures += 1,
                TunnelError::NotReady => self.stats.not_ready_drops += 1,
                TunnelError::Decode(_) => self.stats.malformed += 1,
                TunnelError::ProtocolViolation { .. } => self.stats.violations += 1,
                TunnelError::ResourceExhausted { .. } | TunnelError::Crypto(_) => {},
            }
            debug!(
                peer = %self.peer,
                %connection,
                %error,
                transient = error.is_transient(),
                "dropping inbound message"
            );
        }

        self.flush(now, &mut actions);
        self.maybe_arm_idle(now);
        actions
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant<E>) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }

        while let Some(timer) = self.timers.pop_expired(now) {
            match timer {
                TunnelTimer::KeyExchange => {
                    let wants_traffic = self.wants_traffic();
                    let kx_actions = self.kx.on_retry_timer(now, wants_traffic);
                    self.apply_kx(kx_actions, now, &mut actions);
                },
                TunnelTimer::Keepalive => self.on_keepalive_timer(now),
                TunnelTimer::IdleDestroy => {
                    let idle = self.channels.is_empty()
                        && self.queue.is_empty()
                        && self.kx_outbox.is_none();
                    if idle {
                        info!(peer = %self.peer, "idle tunnel destroyed");
                        self.teardown(&mut actions);
                        return actions;
                    }
                },
                TunnelTimer::Channel(ctn, ChannelTimer::Control) => {
                    self.with_channel(ctn, &mut actions, |ch, io| ch.on_control_timer(io));
                },
                TunnelTimer::Channel(ctn, ChannelTimer::Retransmit) => {
                    self.with_channel(ctn, &mut actions, |ch, io| ch.on_retransmit_timer(now, io));
                },
                TunnelTimer::Channel(ctn, ChannelTimer::Loose) => {
                    self.with_channel(ctn, &mut actions, |ch, io| ch.on_loose_timer(io));
                    self.reap(ctn);
                },
            }
        }

        self.flush(now, &mut actions);
        self.maybe_arm_idle(now);
        actions
    }

    /// Tear the tunnel down; every channel reports `TunnelDestroyed`.
    pub fn destroy(&mut self) -> Vec<TunnelAction> {
        let mut actions = Vec::new();
        if !self.destroyed {
            info!(peer = %self.peer, channels = self.channels.len(), "destroying tunnel");
            self.teardown(&mut actions);
        }
        actions
    }

    fn process_message(
        &mut self,
        bytes: &[u8],
        ports: &impl PortLookup,
        now: Instant<E>,
        actions: &mut Vec<TunnelAction>,
    ) -> Result<(), TunnelError> {
        match TunnelMessage::decode(bytes)? {
            TunnelMessage::KeyExchange(kx) => {
                let wants_traffic = self.wants_traffic();
                let kx_actions = self.kx.handle_kx(&kx, now, wants_traffic);
                self.apply_kx(kx_actions, now, actions);
            },
            TunnelMessage::KeyExchangeAuth(auth) => {
                let kx_actions = self.kx.handle_kx_auth(&auth, now);
                self.apply_kx(kx_actions, now, actions);
            },
            TunnelMessage::Encrypted(frame) => {
                let Received { result, actions: kx_actions } = self.kx.decrypt(&frame, now);
                self.apply_kx(kx_actions, now, actions);
                let plaintext = result?;
                self.stats.frames_received += 1;
                for record in decode_records(&plaintext)? {
                    self.dispatch_record(record, ports, now, actions);
                }
            },
        }
        Ok(())
    }

    fn dispatch_record(
        &mut self,
        record: ChannelRecord,
        ports: &impl PortLookup,
        now: Instant<E>,
        actions: &mut Vec<TunnelAction>,
    ) {
        trace!(peer = %self.peer, kind = ?record.kind(), "record received");
        let ctn = record.ctn();
        match record {
            ChannelRecord::Keepalive => self.stats.keepalives_received += 1,
            ChannelRecord::ChannelOpen(open) => self.handle_channel_open(open, ports, now, actions),
            ChannelRecord::ChannelOpenAck(ack) => {
                if self.with_channel(ack.ctn, actions, |ch, io| ch.handle_open_ack(ack.port, io)).is_none() {
                    self.echo_destroy(ack.ctn);
                }
            },
            ChannelRecord::ChannelDestroy(destroy) => {
                if self.with_channel(destroy.ctn, actions, |ch, io| ch.remote_destroy(io)).is_none() {
                    trace!(peer = %self.peer, ctn = %destroy.ctn, "destroy for unknown channel");
                }
            },
            ChannelRecord::AppData(data) => {
                let target = data.ctn;
                if self.with_channel(target, actions, move |ch, io| ch.handle_data(data, io)).is_none() {
                    self.echo_destroy(target);
                }
            },
            ChannelRecord::AppDataAck(ack) => {
                match self.with_channel(ack.ctn, actions, |ch, io| ch.handle_data_ack(&ack, now, io)) {
                    None => self.echo_destroy(ack.ctn),
                    Some(false) => self.stats.duplicate_acks += 1,
                    Some(true) => {},
                }
            },
        }
        if let Some(ctn) = ctn {
            self.reap(ctn);
        }
    }

    fn handle_channel_open(
        &mut self,
        open: ChannelOpen,
        ports: &impl PortLookup,
        now: Instant<E>,
        actions: &mut Vec<TunnelAction>,
    ) {
        if self.channels.contains_key(&open.ctn) {
            self.with_channel(open.ctn, actions, |ch, io| ch.handle_open(open.port, io));
            return;
        }

        if open.ctn.0 & ChannelNumber::HIGH_BIT != Self::half_bit(&self.peer, &self.local) {
            warn!(peer = %self.peer, ctn = %open.ctn, "peer opened a channel from our number space");
            self.stats.violations += 1;
            return;
        }

        let handle = ChannelHandle { peer: self.peer, ctn: open.ctn };
        let channel = Channel::inbound(handle, open.port, open.options, self.config.channel.clone());
        self.channels.insert(open.ctn, channel);
        self.timers.cancel(&TunnelTimer::IdleDestroy);

        if ports.lookup_open_port(&open.port).is_some() {
            self.with_channel(open.ctn, actions, |ch, io| ch.bind(io));
        } else {
            self.with_channel(open.ctn, actions, |ch, io| ch.park_loose(now, io));
        }
    }

    fn echo_destroy(&mut self, ctn: ChannelNumber) {
        debug!(peer = %self.peer, %ctn, "record for unknown channel, answering with destroy");
        self.stats.destroys_echoed += 1;
        self.queue.push(ChannelRecord::ChannelDestroy(ChannelDestroy { ctn }), SendOrigin::Tunnel);
    }

    fn apply_kx(
        &mut self,
        kx_actions: Vec<KxAction<Instant<E>>>,
        now: Instant<E>,
        actions: &mut Vec<TunnelAction>,
    ) {
        for action in kx_actions {
            match action {
                KxAction::Send(message) => {
                    if self.kx_outbox.replace(message).is_some() {
                        trace!(peer = %self.peer, "superseded unsent key exchange message");
                    }
                    if self.connections.is_empty() {
                        self.request_connection(actions);
                    }
                },
                KxAction::ScheduleRetry(at) => self.timers.schedule(TunnelTimer::KeyExchange, at),
                KxAction::CancelRetry => {
                    self.timers.cancel(&TunnelTimer::KeyExchange);
                },
                KxAction::BecameReady => self.on_keys_ready(now, actions),
                KxAction::Rekeyed => {
                    // Proves the new keys to the peer, which still holds them unverified
                    self.queue.push(ChannelRecord::Keepalive, SendOrigin::Tunnel);
                    self.stats.keepalives_sent += 1;
                },
                KxAction::Stalled => actions.push(TunnelAction::KeyExchangeStalled),
            }
        }
    }

    fn on_keys_ready(&mut self, now: Instant<E>, actions: &mut Vec<TunnelAction>) {
        let ctns: Vec<ChannelNumber> = self.channels.keys().copied().collect();
        for ctn in ctns {
            self.with_channel(ctn, actions, |ch, io| ch.tunnel_up(io));
        }
        if !self.channels.is_empty() {
            self.timers.schedule(TunnelTimer::Keepalive, now + self.config.keepalive_interval);
        }
    }

    fn on_keepalive_timer(&mut self, now: Instant<E>) {
        if !self.kx.is_ready() || self.channels.is_empty() {
            return;
        }
        let interval = self.config.keepalive_interval;
        match self.last_sent {
            Some(last) if now - last < interval => {
                self.timers.schedule(TunnelTimer::Keepalive, last + interval);
            },
            _ => {
                trace!(peer = %self.peer, "sending keepalive");
                self.queue.push(ChannelRecord::Keepalive, SendOrigin::Tunnel);
                self.stats.keepalives_sent += 1;
                self.timers.schedule(TunnelTimer::Keepalive, now + interval);
            },
        }
    }

    /// Initiator: start the key exchange. Either side: ask for a connection
    /// if there is none.
    fn ensure_started(&mut self, now: Instant<E>, actions: &mut Vec<TunnelAction>) {
        if self.kx.state() == KxState::Uninitialized {
            let kx_actions = self.kx.start(now);
            self.apply_kx(kx_actions, now, actions);
        }
        if self.connections.is_empty() {
            self.request_connection(actions);
        }
    }

    fn request_connection(&mut self, actions: &mut Vec<TunnelAction>) {
        if !self.connection_requested {
            debug!(peer = %self.peer, "requesting connection");
            self.connection_requested = true;
            actions.push(TunnelAction::RequestConnection);
        }
    }

    /// Move as much as possible from the outbox and the queue onto ready
    /// connections, one message per connection readiness.
    fn flush(&mut self, now: Instant<E>, actions: &mut Vec<TunnelAction>) {
        if self.destroyed {
            return;
        }
        loop {
            let has_work = self.kx_outbox.is_some() || (self.kx.is_ready() && !self.queue.is_empty());
            if !has_work {
                break;
            }
            let Some(connection) = self.connections.take_ready() else {
                if self.connections.is_empty() {
                    self.request_connection(actions);
                }
                break;
            };

            if let Some(message) = self.kx_outbox.take() {
                match message.encode() {
                    Ok(bytes) => {
                        self.stats.kx_sent += 1;
                        actions.push(TunnelAction::Transmit { connection, bytes });
                    },
                    Err(error) => {
                        warn!(peer = %self.peer, %error, "failed to encode key exchange");
                        self.connections.mark_ready(connection);
                    },
                }
                continue;
            }

            let Some(entry) = self.queue.pop_front() else {
                self.connections.mark_ready(connection);
                break;
            };
            match self.seal(&entry.record, connection, now) {
                Ok(bytes) => {
                    trace!(peer = %self.peer, %connection, kind = ?entry.record.kind(), "frame sent");
                    actions.push(TunnelAction::Transmit { connection, bytes });
                    self.stats.frames_sent += 1;
                    self.frames_since_rekey += 1;
                    self.last_sent = Some(now);
                    if !self.channels.is_empty() {
                        self.timers
                            .schedule(TunnelTimer::Keepalive, now + self.config.keepalive_interval);
                    }
                    self.handed_off(entry.origin, now, actions);
                    self.maybe_auto_rekey(now, actions);
                },
                Err(error) => {
                    warn!(peer = %self.peer, %error, "dropping unsendable record");
                    self.connections.mark_ready(connection);
                },
            }
        }
    }

    fn seal(
        &mut self,
        record: &ChannelRecord,
        connection: ConnectionId,
        now: Instant<E>,
    ) -> Result<Bytes, TunnelError> {
        let plaintext = encode_records(std::slice::from_ref(record))?;
        let sealed = self.kx.encrypt(&plaintext, now, &self.env)?;
        let frame = EncryptedFrame {
            connection_id: connection,
            header_nonce: sealed.header_nonce,
            header: Bytes::from(sealed.header),
            ciphertext: Bytes::from(sealed.ciphertext),
            mac: sealed.mac,
        };
        Ok(TunnelMessage::Encrypted(frame).encode()?)
    }

    fn handed_off(&mut self, origin: SendOrigin, now: Instant<E>, actions: &mut Vec<TunnelAction>) {
        match origin {
            SendOrigin::Tunnel => {},
            SendOrigin::ChannelControl { ctn, kind } => {
                self.with_channel(ctn, actions, |ch, io| ch.control_sent(kind, now, io));
            },
            SendOrigin::ChannelData { ctn, mid } => {
                self.with_channel(ctn, actions, |ch, io| ch.data_sent(mid, now, io));
                self.reap(ctn);
            },
        }
    }

    fn maybe_auto_rekey(&mut self, now: Instant<E>, actions: &mut Vec<TunnelAction>) {
        let Some(limit) = self.config.key_exchange.rekey_after_frames else {
            return;
        };
        if self.frames_since_rekey < limit
            || self.kx.role() != Role::Initiator
            || self.kx.rekey_pending()
        {
            return;
        }
        debug!(peer = %self.peer, frames = self.frames_since_rekey, "frame limit reached, re-keying");
        self.frames_since_rekey = 0;
        let kx_actions = self.kx.rekey(now, &self.env);
        self.apply_kx(kx_actions, now, actions);
    }

    /// Run `f` against channel `ctn` with the tunnel as its I/O.
    fn with_channel<R>(
        &mut self,
        ctn: ChannelNumber,
        actions: &mut Vec<TunnelAction>,
        f: impl FnOnce(&mut Channel<Instant<E>>, &mut TunnelIo<'_, Instant<E>>) -> R,
    ) -> Option<R> {
        let channel = self.channels.get_mut(&ctn)?;
        let mut io = TunnelIo { ctn, queue: &mut self.queue, timers: &mut self.timers, actions };
        Some(f(channel, &mut io))
    }

    /// Drop `ctn` once it has finished.
    fn reap(&mut self, ctn: ChannelNumber) {
        if !self.channels.get(&ctn).is_some_and(Channel::is_finished) {
            return;
        }
        self.channels.remove(&ctn);
        self.timers.cancel_where(|timer| matches!(timer, TunnelTimer::Channel(c, _) if *c == ctn));
        debug!(peer = %self.peer, %ctn, remaining = self.channels.len(), "channel removed");
        if self.channels.is_empty() {
            self.timers.cancel(&TunnelTimer::Keepalive);
        }
    }

    fn maybe_arm_idle(&mut self, now: Instant<E>) {
        if !self.destroyed && self.channels.is_empty() && self.queue.is_empty() {
            self.timers
                .schedule_if_absent(TunnelTimer::IdleDestroy, now + self.config.idle_destroy_delay);
        }
    }

    fn teardown(&mut self, actions: &mut Vec<TunnelAction>) {
        let ctns: Vec<ChannelNumber> = self.channels.keys().copied().collect();
        for ctn in ctns {
            self.with_channel(ctn, actions, |ch, io| ch.tunnel_destroyed(io));
        }
        self.channels.clear();
        self.queue = SendQueue::new();
        self.timers = TimerQueue::new();
        self.kx_outbox = None;
        self.destroyed = true;
        actions.push(TunnelAction::Destroyed);
    }

    fn wants_traffic(&self) -> bool {
        !self.channels.is_empty() || !self.queue.is_empty()
    }

    /// `HIGH_BIT` for numbers allocated by `owner` in a tunnel with `other`.
    fn half_bit(owner: &PeerId, other: &PeerId) -> u32 {
        if owner > other { ChannelNumber::HIGH_BIT } else { 0 }
    }

    fn allocate_ctn(&mut self) -> ChannelNumber {
        let half = Self::half_bit(&self.local, &self.peer);
        loop {
            let ctn = ChannelNumber((self.next_ctn & !ChannelNumber::HIGH_BIT) | half);
            self.next_ctn = self.next_ctn.wrapping_add(1);
            if !self.channels.contains_key(&ctn) {
                return ctn;
            }
        }
    }
}

impl<E: Environment> std::fmt::Debug for Tunnel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("peer", &self.peer)
            .field("kx", &self.kx.state())
            .field("channels", &self.channels.len())
            .field("queued", &self.queue.len())
            .field("connections", &self.connections.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Instant as StdInstant};

    use cadet_proto::{AppData, Mid};

    use super::*;
    use crate::{
        channel::{CloseReason, DEFAULT_LOOSE_TIMEOUT},
        ports::OpenPorts,
        testing::TestEnv,
    };

    const CONN: ConnectionId = ConnectionId(1);
    const PORT: PortHash = PortHash([7; 32]);

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Side {
        Alice,
        Bob,
    }

    /// Two tunnels joined by one lossless connection.
    struct Link {
        alice: Tunnel<TestEnv>,
        bob: Tunnel<TestEnv>,
        alice_ports: OpenPorts,
        bob_ports: OpenPorts,
        to_alice: VecDeque<Bytes>,
        to_bob: VecDeque<Bytes>,
        alice_busy: bool,
        bob_busy: bool,
        alice_events: Vec<ChannelEvent>,
        bob_events: Vec<ChannelEvent>,
        other: Vec<(Side, TunnelAction)>,
        now: StdInstant,
        /// Drop everything sent toward Bob
        cut_to_bob: bool,
    }

    fn identities() -> (Arc<IdentityKeyPair>, Arc<IdentityKeyPair>) {
        let a = Arc::new(IdentityKeyPair::from_secret_bytes([0x11; 32]));
        let b = Arc::new(IdentityKeyPair::from_secret_bytes([0x22; 32]));
        if a.public_bytes() < b.public_bytes() { (a, b) } else { (b, a) }
    }

    fn link_with(config: TunnelConfig) -> Link {
        let (alice_id, bob_id) = identities();
        let alice_peer = PeerId(alice_id.public_bytes());
        let bob_peer = PeerId(bob_id.public_bytes());
        let alice = Tunnel::new(alice_id, bob_peer, TestEnv::new(1), config.clone()).unwrap();
        let bob = Tunnel::new(bob_id, alice_peer, TestEnv::new(2), config).unwrap();
        let mut bob_ports = OpenPorts::new();
        bob_ports.open(PORT).unwrap();
        Link {
            alice,
            bob,
            alice_ports: OpenPorts::new(),
            bob_ports,
            to_alice: VecDeque::new(),
            to_bob: VecDeque::new(),
            alice_busy: false,
            bob_busy: false,
            alice_events: Vec::new(),
            bob_events: Vec::new(),
            other: Vec::new(),
            now: StdInstant::now(),
            cut_to_bob: false,
        }
    }

    fn link() -> Link {
        link_with(TunnelConfig::default())
    }

    impl Link {
        fn absorb(&mut self, side: Side, actions: Vec<TunnelAction>) {
            for action in actions {
                match (side, action) {
                    (Side::Alice, TunnelAction::Transmit { bytes, .. }) => {
                        self.alice_busy = true;
                        if !self.cut_to_bob {
                            self.to_bob.push_back(bytes);
                        }
                    },
                    (Side::Bob, TunnelAction::Transmit { bytes, .. }) => {
                        self.bob_busy = true;
                        self.to_alice.push_back(bytes);
                    },
                    (Side::Alice, TunnelAction::Event(event)) => self.alice_events.push(event),
                    (Side::Bob, TunnelAction::Event(event)) => self.bob_events.push(event),
                    (side, other) => self.other.push((side, other)),
                }
            }
        }

        fn connect(&mut self) {
            let actions = self.alice.on_connection_ready(CONN, self.now);
            self.absorb(Side::Alice, actions);
            let actions = self.bob.on_connection_ready(CONN, self.now);
            self.absorb(Side::Bob, actions);
            self.pump();
        }

        fn pump(&mut self) {
            for _ in 0..10_000 {
                if let Some(bytes) = self.to_bob.pop_front() {
                    let actions = self.bob.on_message_received(CONN, &bytes, &self.bob_ports, self.now);
                    self.absorb(Side::Bob, actions);
                } else if let Some(bytes) = self.to_alice.pop_front() {
                    let actions =
                        self.alice.on_message_received(CONN, &bytes, &self.alice_ports, self.now);
                    self.absorb(Side::Alice, actions);
                } else if self.alice_busy {
                    self.alice_busy = false;
                    let actions = self.alice.on_connection_ready(CONN, self.now);
                    self.absorb(Side::Alice, actions);
                } else if self.bob_busy {
                    self.bob_busy = false;
                    let actions = self.bob.on_connection_ready(CONN, self.now);
                    self.absorb(Side::Bob, actions);
                } else {
                    return;
                }
            }
            panic!("link did not settle");
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            let actions = self.alice.poll_timers(self.now);
            self.absorb(Side::Alice, actions);
            let actions = self.bob.poll_timers(self.now);
            self.absorb(Side::Bob, actions);
            self.pump();
        }

        fn open(&mut self, options: ChannelOptions) -> ChannelNumber {
            let (ctn, actions) = self.alice.open_channel(PORT, options, self.now);
            self.absorb(Side::Alice, actions);
            self.pump();
            ctn
        }

        fn alice_send(&mut self, ctn: ChannelNumber, payload: &'static [u8]) {
            let (_, actions) = self.alice.send(ctn, Bytes::from_static(payload), self.now).unwrap();
            self.absorb(Side::Alice, actions);
            self.pump();
        }

        fn bob_payloads(&self) -> Vec<Bytes> {
            self.bob_events
                .iter()
                .filter_map(|e| match e {
                    ChannelEvent::Data { payload, .. } => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn channel_opens_and_carries_data() {
        let mut link = link();
        link.connect();
        assert_eq!(link.alice.kx_state(), KxState::Ready);

        let ctn = link.open(ChannelOptions::reliable());
        assert!(link.alice_events.contains(&ChannelEvent::Opened {
            handle: ChannelHandle { peer: link.alice.peer(), ctn }
        }));
        assert!(link.bob_events.iter().any(|e| matches!(e, ChannelEvent::Incoming { port, .. } if *port == PORT)));
        assert_eq!(link.bob.kx_state(), KxState::Ready);

        link.alice_send(ctn, b"one");
        let actions = link.bob.acknowledge_received(ctn, link.now);
        link.absorb(Side::Bob, actions);
        link.alice_send(ctn, b"two");

        assert_eq!(link.bob_payloads(), vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        let channel = link.alice.channel(ctn).unwrap();
        assert_eq!(channel.pending_messages(), 0);
    }

    #[test]
    fn opening_without_connection_requests_one() {
        let mut link = link();
        let (_, actions) = link.alice.open_channel(PORT, ChannelOptions::reliable(), link.now);
        assert!(actions.contains(&TunnelAction::RequestConnection));

        // Asked once until a connection shows up
        let (_, actions) = link.alice.open_channel(PORT, ChannelOptions::reliable(), link.now);
        assert!(!actions.contains(&TunnelAction::RequestConnection));

        link.connect();
        assert_eq!(link.alice.channels().filter(|c| c.state() == ChannelState::Ready).count(), 2);
    }

    #[test]
    fn channel_numbers_come_from_separate_halves() {
        let mut link = link();
        link.connect();
        let from_alice = link.open(ChannelOptions::reliable());

        link.alice_ports.open(PORT).unwrap();
        let (from_bob, actions) = link.bob.open_channel(PORT, ChannelOptions::reliable(), link.now);
        link.absorb(Side::Bob, actions);
        link.pump();

        assert_eq!(from_alice.0 & ChannelNumber::HIGH_BIT, 0);
        assert_eq!(from_bob.0 & ChannelNumber::HIGH_BIT, ChannelNumber::HIGH_BIT);
        assert_eq!(link.alice.channel_count(), 2);
        assert_eq!(link.bob.channel_count(), 2);
    }

    #[test]
    fn open_from_wrong_half_is_a_violation() {
        let mut link = link();
        link.connect();
        link.open(ChannelOptions::reliable());
        link.alice_ports.open(PORT).unwrap();

        // Bob's numbers carry the high bit; forge one without it
        let forged = ChannelRecord::ChannelOpen(ChannelOpen {
            ctn: ChannelNumber(5),
            port: PORT,
            options: ChannelOptions::reliable(),
        });
        let (_, actions) = link.bob.enqueue(forged, link.now);
        link.absorb(Side::Bob, actions);
        link.pump();

        assert_eq!(link.alice.channel_count(), 1);
        assert_eq!(link.alice.stats().violations, 1);
    }

    #[test]
    fn data_for_unknown_channel_is_answered_with_destroy() {
        let mut link = link();
        link.connect();

        let stray = ChannelRecord::AppData(AppData {
            ctn: ChannelNumber(3),
            mid: Mid(0),
            payload: Bytes::from_static(b"?"),
        });
        let (_, actions) = link.alice.enqueue(stray, link.now);
        link.absorb(Side::Alice, actions);
        link.pump();

        assert_eq!(link.bob.stats().destroys_echoed, 1);
        // The echoed destroy names an unknown channel on Alice's side too and
        // is not answered again
        assert_eq!(link.alice.stats().destroys_echoed, 0);
    }

    #[test]
    fn channel_without_listener_goes_loose_then_binds() {
        let mut link = link();
        link.bob_ports.close(&PORT).unwrap();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());
        assert_eq!(link.bob.channel(ctn).unwrap().state(), ChannelState::Loose);

        link.bob_ports.open(PORT).unwrap();
        let actions = link.bob.bind_loose(&PORT, link.now);
        link.absorb(Side::Bob, actions);
        link.pump();

        assert_eq!(link.bob.channel(ctn).unwrap().state(), ChannelState::Ready);
        assert_eq!(link.alice.channel(ctn).unwrap().state(), ChannelState::Ready);
    }

    #[test]
    fn loose_channel_expires() {
        let mut link = link();
        link.bob_ports.close(&PORT).unwrap();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());
        assert!(link.bob.channel(ctn).is_some());

        // Keep Alice's open retries from recreating the channel
        link.cut_to_bob = true;
        link.advance(DEFAULT_LOOSE_TIMEOUT);
        assert!(link.bob.channel(ctn).is_none());
        assert!(!link.bob_events.iter().any(|e| matches!(e, ChannelEvent::Closed { .. })));
    }

    #[test]
    fn lost_payload_is_retransmitted() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        link.cut_to_bob = true;
        link.alice_send(ctn, b"lost");
        link.cut_to_bob = false;
        assert!(link.bob_payloads().is_empty());

        link.advance(Duration::from_secs(2));
        assert_eq!(link.bob_payloads(), vec![Bytes::from_static(b"lost")]);
        assert_eq!(link.alice.channel(ctn).unwrap().pending_messages(), 0);
    }

    #[test]
    fn remote_destroy_closes_both_ends() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        let actions = link.alice.destroy_channel(ctn, link.now);
        link.absorb(Side::Alice, actions);
        link.pump();

        assert_eq!(link.alice.channel_count(), 0);
        assert_eq!(link.bob.channel_count(), 0);
        assert!(link.bob_events.contains(&ChannelEvent::Closed {
            handle: ChannelHandle { peer: link.bob.peer(), ctn },
            reason: CloseReason::RemoteDestroy,
        }));
    }

    #[test]
    fn idle_tunnel_is_destroyed() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        link.advance(DEFAULT_IDLE_DESTROY_DELAY * 2);
        assert!(!link.alice.is_destroyed());

        let actions = link.alice.destroy_channel(ctn, link.now);
        link.absorb(Side::Alice, actions);
        link.pump();
        link.advance(DEFAULT_IDLE_DESTROY_DELAY);

        assert!(link.alice.is_destroyed());
        assert!(link.bob.is_destroyed());
        assert!(link.other.contains(&(Side::Alice, TunnelAction::Destroyed)));
    }

    #[test]
    fn idle_timer_spares_tunnel_with_unsent_records() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());
        let actions = link.alice.destroy_channel(ctn, link.now);
        link.absorb(Side::Alice, actions);
        link.pump();
        assert_eq!(link.alice.channel_count(), 0);

        // Alice's only connection stays busy, so the record cannot leave
        link.alice.on_connection_busy(CONN);
        let (_, actions) = link.alice.enqueue(ChannelRecord::Keepalive, link.now);
        link.absorb(Side::Alice, actions);
        assert_eq!(link.alice.queue_len(), 1);

        link.now += DEFAULT_IDLE_DESTROY_DELAY;
        let actions = link.alice.poll_timers(link.now);
        assert!(!actions.contains(&TunnelAction::Destroyed));
        assert!(!link.alice.is_destroyed());
    }

    #[test]
    fn cancelled_record_is_never_sent() {
        let mut link = link();
        link.connect();

        link.alice.on_connection_busy(CONN);
        let stray = ChannelRecord::AppData(AppData {
            ctn: ChannelNumber(3),
            mid: Mid(0),
            payload: Bytes::from_static(b"?"),
        });
        let (handle, actions) = link.alice.enqueue(stray, link.now);
        assert!(actions.is_empty());
        assert_eq!(link.alice.queue_len(), 1);

        assert!(link.alice.cancel(handle));
        assert!(!link.alice.cancel(handle));
        assert_eq!(link.alice.queue_len(), 0);

        let actions = link.alice.on_connection_ready(CONN, link.now);
        link.absorb(Side::Alice, actions);
        link.pump();
        assert_eq!(link.bob.stats().destroys_echoed, 0);
    }

    #[test]
    fn largest_payload_crosses_the_link() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        let payload = Bytes::from(vec![0x5a; cadet_proto::MAX_PAYLOAD_SIZE]);
        let (_, actions) = link.alice.send(ctn, payload.clone(), link.now).unwrap();
        link.absorb(Side::Alice, actions);
        link.pump();

        assert_eq!(link.bob_payloads(), vec![payload]);
        assert_eq!(link.alice.channel(ctn).unwrap().pending_messages(), 0);

        let oversized = Bytes::from(vec![0x5a; cadet_proto::MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            link.alice.send(ctn, oversized, link.now),
            Err(SendRefused::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn destroy_closes_channels_with_tunnel_reason() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        let actions = link.alice.destroy();
        assert!(actions.contains(&TunnelAction::Event(ChannelEvent::Closed {
            handle: ChannelHandle { peer: link.alice.peer(), ctn },
            reason: CloseReason::TunnelDestroyed,
        })));
        assert!(actions.contains(&TunnelAction::Destroyed));
        assert!(link.alice.destroy().is_empty());
    }

    #[test]
    fn keepalive_sent_after_silence() {
        let mut link = link();
        link.connect();
        link.open(ChannelOptions::reliable());

        link.advance(DEFAULT_KEEPALIVE_INTERVAL);
        assert_eq!(link.alice.stats().keepalives_sent, 1);
        assert_eq!(link.bob.stats().keepalives_received, 1);
    }

    #[test]
    fn garbage_is_counted_and_dropped() {
        let mut link = link();
        link.connect();
        let state = link.bob.kx_state();

        let actions = link.bob.on_message_received(CONN, &[0xff, 1, 2], &link.bob_ports, link.now);
        assert!(actions.is_empty());
        assert_eq!(link.bob.stats().malformed, 1);
        assert_eq!(link.bob.kx_state(), state);
    }

    #[test]
    fn explicit_rekey_keeps_traffic_flowing() {
        let mut link = link();
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        let actions = link.alice.rekey(link.now);
        link.absorb(Side::Alice, actions);
        link.pump();

        link.alice_send(ctn, b"after rekey");
        assert_eq!(link.bob_payloads(), vec![Bytes::from_static(b"after rekey")]);
        assert!(!link.alice.kx.rekey_pending());
    }

    #[test]
    fn rekeys_after_configured_frame_count() {
        let mut config = TunnelConfig::default();
        config.key_exchange.rekey_after_frames = Some(3);
        let mut link = link_with(config);
        link.connect();
        let ctn = link.open(ChannelOptions::reliable());

        let kx_before = link.alice.stats().kx_sent;
        for payload in [&b"a"[..], b"b", b"c", b"d"] {
            let (_, actions) = link.alice.send(ctn, Bytes::from_static(payload), link.now).unwrap();
            link.absorb(Side::Alice, actions);
            link.pump();
            let actions = link.bob.acknowledge_received(ctn, link.now);
            link.absorb(Side::Bob, actions);
            link.pump();
        }

        assert!(link.alice.stats().kx_sent > kx_before);
        assert_eq!(link.bob_payloads().len(), 4);
    }
}
