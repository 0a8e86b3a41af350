//! Channel reliability engine.
//!
//! One [`Channel`] is a bidirectional message stream inside a tunnel. It
//! assigns sequence numbers, buffers unacknowledged payloads with
//! per-message retransmission deadlines, reorders or forwards inbound
//! payloads according to the channel options, and grants the application
//! one unit of credit per free slot in its window.
//!
//! The channel never touches the tunnel directly. Everything it wants done
//! (queue a record, arm a timer, surface an event) goes through the
//! [`ChannelIo`] passed into each call.
//!
//! # State Machine
//!
//! ```text
//!  opener                                   listener side
//! ┌─────┐ tunnel up ┌──────────┐         ┌─────┐ port open ┌───────┐
//! │ New │ ────────> │ OpenSent │         │ New │ ────────> │ Ready │
//! └─────┘           └──────────┘         └─────┘           └───────┘
//!                        │ OpenAck /        │ no listener      ↑
//!                        │ AppDataAck       ↓                  │ accept(port)
//!                        ↓              ┌───────┐              │
//!                    ┌───────┐          │ Loose │ ─────────────┘
//!                    │ Ready │          └───────┘
//!                    └───────┘              │ timeout: removed silently
//! ```
//!
//! # Sequence numbers
//!
//! `mid_send` is the next number to assign. On reliable in-order channels
//! `mid_recv` is the next number to deliver; on out-of-order channels it is
//! the lowest number not yet received. Bit `i` of `futures` records receipt
//! of `mid_recv + 1 + i`.

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use cadet_proto::{
    AppData, AppDataAck, ChannelDestroy, ChannelNumber, ChannelOpen, ChannelOpenAck,
    ChannelOptions, ChannelRecord, MAX_PAYLOAD_SIZE, Mid, PeerId, PortHash,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    env::Timestamp,
    error::SendRefused,
    queue::{ControlKind, QueueHandle, SendOrigin},
    rtt::RttEstimator,
    timer::std_backoff,
};

/// Retry delay for a record before any round trip was measured.
pub const DEFAULT_CHANNEL_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Lower bound for any retransmission delay.
pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(75);

/// How long an inbound channel without a listener is kept.
pub const DEFAULT_LOOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Window of unacknowledged messages for buffered channels.
pub const DEFAULT_MAX_PENDING_MESSAGES: u32 = 4;

/// Window of unacknowledged messages for `no_buffer` channels.
pub const DEFAULT_MAX_PENDING_MESSAGES_NO_BUFFER: u32 = 1;

/// Messages accepted before the channel is open.
pub const DEFAULT_EARLY_DATA_MESSAGES: u32 = 1;

/// Consecutive out-of-order arrivals before an ack is forced.
pub const DEFAULT_ACK_SKIP_LIMIT: u32 = 2;

/// Highest sequence distance tracked by the `futures` bitmask.
const RECEIVE_WINDOW: u32 = u64::BITS;

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Retry delay before any round trip was measured
    pub initial_retry_delay: Duration,
    /// Lower bound for retransmission delays
    pub min_retry_delay: Duration,
    /// Lifetime of a channel waiting for a listener
    pub loose_timeout: Duration,
    /// Window for buffered channels
    pub max_pending_messages: u32,
    /// Window for `no_buffer` channels
    pub max_pending_messages_no_buffer: u32,
    /// Messages accepted before the channel is open
    pub early_data_messages: u32,
    /// Out-of-order arrivals acknowledged lazily before an ack is forced
    pub ack_skip_limit: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: DEFAULT_CHANNEL_INITIAL_RETRY_DELAY,
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            loose_timeout: DEFAULT_LOOSE_TIMEOUT,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            max_pending_messages_no_buffer: DEFAULT_MAX_PENDING_MESSAGES_NO_BUFFER,
            early_data_messages: DEFAULT_EARLY_DATA_MESSAGES,
            ack_skip_limit: DEFAULT_ACK_SKIP_LIMIT,
        }
    }
}

/// Application-visible name of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle {
    /// Remote end of the tunnel
    pub peer: PeerId,
    /// Number within the tunnel
    pub ctn: ChannelNumber,
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, nothing sent
    New,
    /// Inbound, waiting for a listener on its port
    Loose,
    /// Opener sent `ChannelOpen`, waiting for the ack
    OpenSent,
    /// Data may flow
    Ready,
}

/// Why a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer destroyed the channel
    RemoteDestroy,
    /// The tunnel carrying the channel went away
    TunnelDestroyed,
}

/// Sending capacity left after a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    /// Further messages the window accepts right now
    pub available: u32,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Our open request was acknowledged
    Opened {
        /// Channel
        handle: ChannelHandle,
    },
    /// A peer opened a channel on one of our ports
    Incoming {
        /// Channel
        handle: ChannelHandle,
        /// Port it was bound to
        port: PortHash,
        /// Options chosen by the opener
        options: ChannelOptions,
    },
    /// A payload is delivered; call `acknowledge_received` for the next one
    Data {
        /// Channel
        handle: ChannelHandle,
        /// Payload
        payload: Bytes,
    },
    /// Window space was freed
    Credit {
        /// Channel
        handle: ChannelHandle,
        /// Messages the window accepts now
        available: u32,
    },
    /// The channel is gone
    Closed {
        /// Channel
        handle: ChannelHandle,
        /// Why
        reason: CloseReason,
    },
}

/// Per-channel timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelTimer {
    /// Retransmit `ChannelOpen`
    Control,
    /// Retransmit the earliest due payload
    Retransmit,
    /// Drop a channel nobody accepted
    Loose,
}

/// What a channel may ask of its tunnel.
pub trait ChannelIo<I> {
    /// Queue a plaintext record for transmission.
    fn send(&mut self, record: ChannelRecord, origin: SendOrigin) -> QueueHandle;

    /// Withdraw a queued record if it has not been transmitted.
    fn cancel(&mut self, handle: QueueHandle);

    /// Arm or move a timer.
    fn schedule(&mut self, timer: ChannelTimer, at: I);

    /// Disarm a timer.
    fn cancel_timer(&mut self, timer: ChannelTimer);

    /// Surface an event to the application.
    fn emit(&mut self, event: ChannelEvent);
}

#[derive(Debug, Clone)]
struct Unacked<I> {
    mid: Mid,
    payload: Bytes,
    /// Set while a copy waits in the tunnel queue
    queued: Option<QueueHandle>,
    first_sent: Option<I>,
    next_retry: Option<I>,
    retry_delay: Duration,
    retransmitted: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    mid: Mid,
    payload: Bytes,
}

/// One channel.
#[derive(Debug)]
pub struct Channel<I> {
    handle: ChannelHandle,
    port: PortHash,
    options: ChannelOptions,
    state: ChannelState,
    owner: bool,
    /// Local destroy waits for outstanding acks
    destroying: bool,
    finished: bool,
    mid_send: Mid,
    mid_recv: Mid,
    futures: u64,
    /// Sorted by `next_retry`; never-sent entries last
    unacked: VecDeque<Unacked<I>>,
    /// Received but not yet delivered, sorted by sequence
    recv_queue: VecDeque<Pending>,
    client_ready: bool,
    control_retry_delay: Duration,
    pending_control: Option<QueueHandle>,
    pending_ack: Option<QueueHandle>,
    skipped_acks: u32,
    rtt: RttEstimator,
    config: ChannelConfig,
}

impl<I: Timestamp> Channel<I> {
    /// Channel opened locally toward `port`.
    pub fn outbound(
        handle: ChannelHandle,
        port: PortHash,
        options: ChannelOptions,
        config: ChannelConfig,
    ) -> Self {
        Self::new(handle, port, options, config, true)
    }

    /// Channel opened by the peer.
    pub fn inbound(
        handle: ChannelHandle,
        port: PortHash,
        options: ChannelOptions,
        config: ChannelConfig,
    ) -> Self {
        Self::new(handle, port, options, config, false)
    }

    fn new(
        handle: ChannelHandle,
        port: PortHash,
        options: ChannelOptions,
        config: ChannelConfig,
        owner: bool,
    ) -> Self {
        Self {
            handle,
            port,
            options,
            state: ChannelState::New,
            owner,
            destroying: false,
            finished: false,
            mid_send: Mid(0),
            mid_recv: Mid(0),
            futures: 0,
            unacked: VecDeque::new(),
            recv_queue: VecDeque::new(),
            client_ready: true,
            control_retry_delay: config.initial_retry_delay,
            pending_control: None,
            pending_ack: None,
            skipped_acks: 0,
            rtt: RttEstimator::default(),
            config,
        }
    }

    /// Application handle.
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    /// Channel number.
    pub fn ctn(&self) -> ChannelNumber {
        self.handle.ctn
    }

    /// Lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Delivery options.
    pub fn options(&self) -> ChannelOptions {
        self.options
    }

    /// Hashed port.
    pub fn port(&self) -> PortHash {
        self.port
    }

    /// Whether the channel is done and may be removed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether a local destroy waits for acknowledgments.
    pub fn is_destroying(&self) -> bool {
        self.destroying
    }

    /// Window size for these options.
    pub fn max_pending(&self) -> u32 {
        if self.options.no_buffer {
            self.config.max_pending_messages_no_buffer
        } else {
            self.config.max_pending_messages
        }
    }

    /// Messages sent but not released (acknowledged, or handed off when
    /// unreliable).
    pub fn pending_messages(&self) -> u32 {
        self.unacked.len() as u32
    }

    /// Free window slots.
    pub fn available_credit(&self) -> u32 {
        self.max_pending().saturating_sub(self.pending_messages())
    }

    /// Next sequence number to assign.
    pub fn mid_send(&self) -> Mid {
        self.mid_send
    }

    /// Receive cursor.
    pub fn mid_recv(&self) -> Mid {
        self.mid_recv
    }

    /// Received payloads waiting for the consumer.
    pub fn queued_received(&self) -> usize {
        self.recv_queue.len()
    }

    /// Current round-trip estimate.
    pub fn rtt_estimate(&self) -> Option<Duration> {
        self.rtt.estimate()
    }

    /// The tunnel's keys are ready: an opener (re)sends its open request.
    pub fn tunnel_up(&mut self, io: &mut impl ChannelIo<I>) {
        if self.finished || !self.owner {
            return;
        }
        if matches!(self.state, ChannelState::New | ChannelState::OpenSent) {
            self.send_open(io);
        }
    }

    /// A listener exists for our port: confirm the open and surface it.
    pub fn bind(&mut self, io: &mut impl ChannelIo<I>) {
        if self.owner || !matches!(self.state, ChannelState::New | ChannelState::Loose) {
            return;
        }
        io.cancel_timer(ChannelTimer::Loose);
        self.state = ChannelState::Ready;
        debug!(ctn = %self.ctn(), peer = %self.handle.peer, "channel bound");
        self.send_open_ack(io);
        io.emit(ChannelEvent::Incoming {
            handle: self.handle,
            port: self.port,
            options: self.options,
        });
    }

    /// No listener: park the channel until one appears or the timeout hits.
    pub fn park_loose(&mut self, now: I, io: &mut impl ChannelIo<I>) {
        if self.owner || self.state != ChannelState::New {
            return;
        }
        debug!(ctn = %self.ctn(), "no listener, channel loose");
        self.state = ChannelState::Loose;
        io.schedule(ChannelTimer::Loose, now + self.config.loose_timeout);
    }

    /// The loose timeout fired.
    pub fn on_loose_timer(&mut self, io: &mut impl ChannelIo<I>) {
        if self.state == ChannelState::Loose && !self.finished {
            debug!(ctn = %self.ctn(), "loose channel expired");
            self.cancel_all(io);
            self.finished = true;
        }
    }

    /// The open-retry timer fired.
    pub fn on_control_timer(&mut self, io: &mut impl ChannelIo<I>) {
        if self.state == ChannelState::OpenSent && !self.finished && self.pending_control.is_none()
        {
            debug!(ctn = %self.ctn(), "retransmitting open");
            self.send_open(io);
        }
    }

    /// A repeated `ChannelOpen` for this number arrived.
    pub fn handle_open(&mut self, port: PortHash, io: &mut impl ChannelIo<I>) {
        if self.owner || port != self.port {
            warn!(ctn = %self.ctn(), "channel number reused with different port, ignoring");
            return;
        }
        if self.state == ChannelState::Ready && self.pending_control.is_none() {
            debug!(ctn = %self.ctn(), "duplicate open, resending ack");
            self.send_open_ack(io);
        }
    }

    /// `ChannelOpenAck` arrived.
    pub fn handle_open_ack(&mut self, port: PortHash, io: &mut impl ChannelIo<I>) {
        if !self.owner || self.state != ChannelState::OpenSent {
            debug!(ctn = %self.ctn(), state = ?self.state, "ignoring open ack");
            return;
        }
        if port != self.port {
            warn!(ctn = %self.ctn(), "open ack for a different port, ignoring");
            return;
        }
        self.become_ready(io);
    }

    /// Application submits a payload.
    ///
    /// # Errors
    ///
    /// - `SendRefused::Destroying` after a local destroy
    /// - `SendRefused::PayloadTooLarge` above [`MAX_PAYLOAD_SIZE`]
    /// - `SendRefused::NotReady` before the channel opened, once the
    ///   early-data allowance is used
    /// - `SendRefused::WindowFull` when the window is full
    pub fn send(
        &mut self,
        payload: Bytes,
        io: &mut impl ChannelIo<I>,
    ) -> Result<Credit, SendRefused> {
        if self.destroying || self.finished {
            return Err(SendRefused::Destroying);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SendRefused::PayloadTooLarge { size: payload.len(), max: MAX_PAYLOAD_SIZE });
        }

        let in_flight = self.pending_messages();
        let max = self.max_pending();
        match self.state {
            ChannelState::Ready if in_flight >= max => {
                return Err(SendRefused::WindowFull { in_flight, max });
            },
            ChannelState::Ready => {},
            ChannelState::New | ChannelState::OpenSent if self.owner => {
                if in_flight >= self.config.early_data_messages.min(max) {
                    return Err(SendRefused::NotReady);
                }
            },
            _ => return Err(SendRefused::NotReady),
        }

        let mid = self.mid_send;
        self.mid_send = mid.next();
        let queued = (self.state == ChannelState::Ready).then(|| self.queue_data(mid, &payload, io));
        trace!(ctn = %self.ctn(), %mid, early = queued.is_none(), "payload accepted");

        self.unacked.push_back(Unacked {
            mid,
            payload,
            queued,
            first_sent: None,
            next_retry: None,
            retry_delay: Duration::ZERO,
            retransmitted: false,
        });
        Ok(Credit { available: self.available_credit() })
    }

    /// A control record of ours was handed to a connection.
    pub fn control_sent(&mut self, kind: ControlKind, now: I, io: &mut impl ChannelIo<I>) {
        match kind {
            ControlKind::DataAck => self.pending_ack = None,
            _ => self.pending_control = None,
        }
        if kind == ControlKind::Open && self.state == ChannelState::OpenSent {
            io.schedule(ChannelTimer::Control, now + self.control_retry_delay);
            self.control_retry_delay = std_backoff(self.control_retry_delay);
        }
    }

    /// A payload of ours was handed to a connection.
    pub fn data_sent(&mut self, mid: Mid, now: I, io: &mut impl ChannelIo<I>) {
        let Some(index) = self.unacked.iter().position(|entry| entry.mid == mid) else {
            return;
        };

        if !self.options.reliable {
            self.unacked.remove(index);
            self.emit_credit(io);
            self.check_deferred_destroy(io);
            return;
        }

        let Some(mut entry) = self.unacked.remove(index) else {
            return;
        };
        entry.queued = None;
        if entry.first_sent.is_none() {
            entry.first_sent = Some(now);
        } else {
            entry.retransmitted = true;
        }
        let base = if entry.retry_delay.is_zero() {
            self.rtt.estimate().unwrap_or(self.config.initial_retry_delay)
        } else {
            entry.retry_delay
        };
        entry.retry_delay = std_backoff(base).max(self.config.min_retry_delay);
        let at = now + entry.retry_delay;
        entry.next_retry = Some(at);

        let position = self
            .unacked
            .iter()
            .position(|other| other.next_retry.is_none_or(|t| t > at))
            .unwrap_or(self.unacked.len());
        self.unacked.insert(position, entry);
        self.reschedule_retransmit(io);
    }

    /// The retransmission timer fired.
    pub fn on_retransmit_timer(&mut self, now: I, io: &mut impl ChannelIo<I>) {
        if self.finished {
            return;
        }
        let ctn = self.ctn();
        for entry in &mut self.unacked {
            let due = entry.queued.is_none() && entry.next_retry.is_some_and(|t| t <= now);
            if due {
                debug!(%ctn, mid = %entry.mid, delay = ?entry.retry_delay, "retransmitting");
                let record =
                    ChannelRecord::AppData(AppData { ctn, mid: entry.mid, payload: entry.payload.clone() });
                entry.queued = Some(io.send(record, SendOrigin::ChannelData { ctn, mid: entry.mid }));
            }
        }
        self.reschedule_retransmit(io);
    }

    /// `AppDataAck` arrived. Returns whether it acknowledged anything new.
    pub fn handle_data_ack(
        &mut self,
        ack: &AppDataAck,
        now: I,
        io: &mut impl ChannelIo<I>,
    ) -> bool {
        if self.finished {
            return false;
        }
        if self.owner && self.state == ChannelState::OpenSent {
            debug!(ctn = %self.ctn(), "data ack before open ack, treating as open ack");
            self.become_ready(io);
        }
        if !self.options.reliable {
            return false;
        }

        let before = self.unacked.len();
        let rtt = &mut self.rtt;
        let mut withdrawn = Vec::new();
        self.unacked.retain(|entry| {
            let distance = entry.mid.distance_from(ack.mid);
            let acked = if (distance as i32) < 0 {
                true
            } else if distance == 0 || distance > RECEIVE_WINDOW {
                false
            } else {
                ack.futures & (1u64 << (distance - 1)) != 0
            };
            if acked {
                withdrawn.extend(entry.queued);
                if let (false, Some(sent)) = (entry.retransmitted, entry.first_sent) {
                    rtt.observe(now - sent);
                }
            }
            !acked
        });
        for handle in withdrawn {
            io.cancel(handle);
        }

        let freed = before - self.unacked.len();
        if freed == 0 {
            debug!(ctn = %self.ctn(), mid = %ack.mid, "duplicate ack");
            return false;
        }
        trace!(ctn = %self.ctn(), freed, "payloads acknowledged");
        self.reschedule_retransmit(io);
        self.emit_credit(io);
        self.check_deferred_destroy(io);
        true
    }

    /// `AppData` arrived.
    pub fn handle_data(&mut self, data: AppData, io: &mut impl ChannelIo<I>) {
        if self.finished {
            return;
        }
        if self.destroying {
            // Our own payloads still go out; the destroy follows their acks
            if self.state == ChannelState::OpenSent {
                self.become_ready(io);
            }
            debug!(ctn = %self.ctn(), mid = %data.mid, "data for a channel being destroyed, dropping");
            return;
        }
        match self.state {
            ChannelState::New | ChannelState::Loose => {
                debug!(ctn = %self.ctn(), "data on unbound channel, dropping");
                return;
            },
            ChannelState::OpenSent => self.become_ready(io),
            ChannelState::Ready => {},
        }

        if !self.options.reliable {
            self.receive_unreliable(data, io);
            return;
        }

        let delta = data.mid.distance_from(self.mid_recv);
        if (delta as i32) < 0 {
            debug!(ctn = %self.ctn(), mid = %data.mid, "duplicate payload");
            self.send_ack(io);
            return;
        }
        if delta > RECEIVE_WINDOW {
            warn!(ctn = %self.ctn(), mid = %data.mid, "payload beyond receive window");
            self.send_ack(io);
            return;
        }
        if delta == 0 {
            if self.recv_queue.iter().any(|p| p.mid == data.mid) {
                debug!(ctn = %self.ctn(), mid = %data.mid, "duplicate payload");
                self.send_ack(io);
                return;
            }
        } else {
            let bit = 1u64 << (delta - 1);
            if self.futures & bit != 0 {
                debug!(ctn = %self.ctn(), mid = %data.mid, "duplicate payload");
                self.send_ack(io);
                return;
            }
            self.futures |= bit;
        }

        let in_sequence = delta == 0;
        let mut ack_now = false;
        if self.options.out_of_order {
            if in_sequence {
                self.advance_past_received();
                ack_now = true;
            }
            if self.client_ready {
                self.deliver(data.payload, io);
            } else {
                self.recv_queue.push_back(Pending { mid: data.mid, payload: data.payload });
            }
        } else if in_sequence && self.client_ready {
            self.mid_recv = self.mid_recv.next();
            self.futures >>= 1;
            self.deliver(data.payload, io);
            ack_now = true;
        } else {
            self.insert_received(data.mid, data.payload);
        }

        if ack_now {
            self.send_ack(io);
        } else if !in_sequence {
            self.maybe_ack(io);
        }
    }

    /// The consumer is ready for the next payload.
    pub fn client_ack(&mut self, io: &mut impl ChannelIo<I>) {
        if self.finished {
            return;
        }
        self.client_ready = true;
        let Some(front) = self.recv_queue.front() else {
            return;
        };
        let in_order = self.options.reliable && !self.options.out_of_order;
        if in_order && front.mid != self.mid_recv {
            return;
        }
        let Some(next) = self.recv_queue.pop_front() else {
            return;
        };

        if in_order {
            self.mid_recv = self.mid_recv.next();
            self.futures >>= 1;
            self.deliver(next.payload, io);
            self.send_ack(io);
        } else {
            if !self.options.reliable {
                self.mid_recv = next.mid.next();
            }
            self.deliver(next.payload, io);
        }
    }

    /// The application destroyed the channel.
    ///
    /// Payloads not yet released keep the channel alive, including early
    /// data still waiting for the open to complete. The `ChannelDestroy`
    /// goes out once the last of them is acknowledged (or handed off, when
    /// unreliable). Inbound payloads are dropped meanwhile.
    pub fn local_destroy(&mut self, io: &mut impl ChannelIo<I>) {
        if self.finished || self.destroying {
            return;
        }
        self.recv_queue.clear();
        if !self.unacked.is_empty() {
            debug!(
                ctn = %self.ctn(),
                unacked = self.unacked.len(),
                "destroy deferred until payloads are acknowledged"
            );
            self.destroying = true;
            return;
        }
        self.finish_local_destroy(io);
    }

    /// `ChannelDestroy` arrived.
    ///
    /// Deliverable payloads are handed to the application before `Closed`.
    pub fn remote_destroy(&mut self, io: &mut impl ChannelIo<I>) {
        if self.finished {
            return;
        }
        let silent = self.destroying || self.state == ChannelState::Loose;
        if !silent {
            let in_order = self.options.reliable && !self.options.out_of_order;
            while let Some(front) = self.recv_queue.front() {
                if in_order && front.mid != self.mid_recv {
                    break;
                }
                let Some(next) = self.recv_queue.pop_front() else {
                    break;
                };
                self.mid_recv = next.mid.next();
                io.emit(ChannelEvent::Data { handle: self.handle, payload: next.payload });
            }
            io.emit(ChannelEvent::Closed { handle: self.handle, reason: CloseReason::RemoteDestroy });
        }
        debug!(ctn = %self.ctn(), "channel destroyed by peer");
        self.cancel_all(io);
        self.finished = true;
    }

    /// The tunnel is going away.
    pub fn tunnel_destroyed(&mut self, io: &mut impl ChannelIo<I>) {
        if self.finished {
            return;
        }
        if !self.destroying && self.state != ChannelState::Loose {
            io.emit(ChannelEvent::Closed {
                handle: self.handle,
                reason: CloseReason::TunnelDestroyed,
            });
        }
        self.cancel_all(io);
        self.finished = true;
    }

    fn send_open(&mut self, io: &mut impl ChannelIo<I>) {
        if let Some(previous) = self.pending_control.take() {
            io.cancel(previous);
        }
        self.state = ChannelState::OpenSent;
        let record = ChannelRecord::ChannelOpen(ChannelOpen {
            ctn: self.ctn(),
            port: self.port,
            options: self.options,
        });
        self.pending_control = Some(io.send(
            record,
            SendOrigin::ChannelControl { ctn: self.ctn(), kind: ControlKind::Open },
        ));
    }

    fn send_open_ack(&mut self, io: &mut impl ChannelIo<I>) {
        let record = ChannelRecord::ChannelOpenAck(ChannelOpenAck { ctn: self.ctn(), port: self.port });
        self.pending_control = Some(io.send(
            record,
            SendOrigin::ChannelControl { ctn: self.ctn(), kind: ControlKind::OpenAck },
        ));
    }

    fn send_destroy(&mut self, io: &mut impl ChannelIo<I>) {
        let ctn = self.ctn();
        io.send(
            ChannelRecord::ChannelDestroy(ChannelDestroy { ctn }),
            SendOrigin::ChannelControl { ctn, kind: ControlKind::Destroy },
        );
    }

    fn send_ack(&mut self, io: &mut impl ChannelIo<I>) {
        if !self.options.reliable {
            return;
        }
        if let Some(previous) = self.pending_ack.take() {
            io.cancel(previous);
        }
        let ack = AppDataAck { ctn: self.ctn(), mid: self.mid_recv, futures: self.futures };
        self.pending_ack = Some(io.send(
            ChannelRecord::AppDataAck(ack),
            SendOrigin::ChannelControl { ctn: self.ctn(), kind: ControlKind::DataAck },
        ));
        self.skipped_acks = 0;
    }

    fn maybe_ack(&mut self, io: &mut impl ChannelIo<I>) {
        if self.futures == u64::MAX || self.skipped_acks >= self.config.ack_skip_limit {
            self.send_ack(io);
        } else {
            self.skipped_acks += 1;
        }
    }

    fn queue_data(&self, mid: Mid, payload: &Bytes, io: &mut impl ChannelIo<I>) -> QueueHandle {
        let ctn = self.ctn();
        io.send(
            ChannelRecord::AppData(AppData { ctn, mid, payload: payload.clone() }),
            SendOrigin::ChannelData { ctn, mid },
        )
    }

    fn become_ready(&mut self, io: &mut impl ChannelIo<I>) {
        io.cancel_timer(ChannelTimer::Control);
        if let Some(open) = self.pending_control.take() {
            io.cancel(open);
        }
        self.state = ChannelState::Ready;
        debug!(ctn = %self.ctn(), peer = %self.handle.peer, "channel open");
        if !self.destroying {
            io.emit(ChannelEvent::Opened { handle: self.handle });
        }

        let ctn = self.ctn();
        for entry in &mut self.unacked {
            if entry.queued.is_none() && entry.first_sent.is_none() {
                let record = ChannelRecord::AppData(AppData {
                    ctn,
                    mid: entry.mid,
                    payload: entry.payload.clone(),
                });
                entry.queued = Some(io.send(record, SendOrigin::ChannelData { ctn, mid: entry.mid }));
            }
        }
        self.emit_credit(io);
    }

    fn emit_credit(&self, io: &mut impl ChannelIo<I>) {
        let available = self.available_credit();
        if available > 0 && !self.destroying {
            io.emit(ChannelEvent::Credit { handle: self.handle, available });
        }
    }

    fn deliver(&mut self, payload: Bytes, io: &mut impl ChannelIo<I>) {
        self.client_ready = false;
        io.emit(ChannelEvent::Data { handle: self.handle, payload });
    }

    /// Out-of-order cursor: step over every number already received.
    fn advance_past_received(&mut self) {
        loop {
            self.mid_recv = self.mid_recv.next();
            let next_received = self.futures & 1 == 1;
            self.futures >>= 1;
            if !next_received {
                break;
            }
        }
    }

    fn insert_received(&mut self, mid: Mid, payload: Bytes) {
        let distance = mid.distance_from(self.mid_recv);
        let position = self
            .recv_queue
            .iter()
            .position(|p| p.mid.distance_from(self.mid_recv) > distance)
            .unwrap_or(self.recv_queue.len());
        self.recv_queue.insert(position, Pending { mid, payload });
    }

    fn receive_unreliable(&mut self, data: AppData, io: &mut impl ChannelIo<I>) {
        if data.mid.is_before(self.mid_recv) {
            trace!(ctn = %self.ctn(), mid = %data.mid, "late payload dropped");
            return;
        }
        if self.recv_queue.iter().any(|p| p.mid == data.mid) {
            return;
        }
        if self.client_ready && self.recv_queue.is_empty() {
            self.mid_recv = data.mid.next();
            self.deliver(data.payload, io);
            return;
        }
        if self.recv_queue.len() >= self.max_pending() as usize {
            if let Some(dropped) = self.recv_queue.pop_front() {
                debug!(ctn = %self.ctn(), mid = %dropped.mid, "receive queue full, dropping oldest");
            }
        }
        self.insert_received(data.mid, data.payload);
    }

    fn reschedule_retransmit(&self, io: &mut impl ChannelIo<I>) {
        let earliest = self
            .unacked
            .iter()
            .filter(|entry| entry.queued.is_none())
            .filter_map(|entry| entry.next_retry)
            .min();
        match earliest {
            Some(at) => io.schedule(ChannelTimer::Retransmit, at),
            None => io.cancel_timer(ChannelTimer::Retransmit),
        }
    }

    fn check_deferred_destroy(&mut self, io: &mut impl ChannelIo<I>) {
        if self.destroying && self.unacked.is_empty() {
            debug!(ctn = %self.ctn(), "all payloads acknowledged, completing destroy");
            self.finish_local_destroy(io);
        }
    }

    fn finish_local_destroy(&mut self, io: &mut impl ChannelIo<I>) {
        self.cancel_all(io);
        if matches!(self.state, ChannelState::OpenSent | ChannelState::Ready) {
            self.send_destroy(io);
        }
        self.finished = true;
    }

    fn cancel_all(&mut self, io: &mut impl ChannelIo<I>) {
        io.cancel_timer(ChannelTimer::Control);
        io.cancel_timer(ChannelTimer::Retransmit);
        io.cancel_timer(ChannelTimer::Loose);
        if let Some(handle) = self.pending_control.take() {
            io.cancel(handle);
        }
        if let Some(handle) = self.pending_ack.take() {
            io.cancel(handle);
        }
        for entry in &mut self.unacked {
            if let Some(handle) = entry.queued.take() {
                io.cancel(handle);
            }
        }
    }
}
