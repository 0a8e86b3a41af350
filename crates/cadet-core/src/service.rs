//! Process-wide registry of tunnels and open ports.
//!
//! The [`Service`] is what an application and a transport driver talk to. It
//! creates a [`Tunnel`] per peer on first use, routes application calls by
//! [`ChannelHandle`], and tags every tunnel action with the peer it belongs
//! to. Tunnels that report [`TunnelAction::Destroyed`] are dropped here.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use bytes::Bytes;
use cadet_crypto::{IdentityKeyPair, port_hash};
use cadet_proto::{ChannelOptions, ConnectionId, PeerId, PortHash};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelEvent, ChannelHandle, Credit},
    env::Environment,
    error::{SendRefused, ServiceError},
    ports::OpenPorts,
    tunnel::{Tunnel, TunnelAction, TunnelConfig},
};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Settings for every tunnel and its channels
    pub tunnel: TunnelConfig,
}

/// Actions for the application and the transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    /// Hand `bytes` to `connection` toward `peer`
    Transmit {
        /// Remote peer
        peer: PeerId,
        /// Connection to use
        connection: ConnectionId,
        /// Encoded tunnel message
        bytes: Bytes,
    },
    /// Establish a connection toward `peer`
    RequestConnection {
        /// Remote peer
        peer: PeerId,
    },
    /// Application event
    Event(ChannelEvent),
    /// Key exchange with `peer` is not progressing
    KeyExchangeStalled {
        /// Remote peer
        peer: PeerId,
    },
    /// The tunnel toward `peer` was destroyed
    TunnelDestroyed {
        /// Remote peer
        peer: PeerId,
    },
}

type Instant<E> = <E as Environment>::Instant;

/// All tunnels of one local identity.
pub struct Service<E: Environment> {
    identity: Arc<IdentityKeyPair>,
    local: PeerId,
    env: E,
    config: ServiceConfig,
    tunnels: BTreeMap<PeerId, Tunnel<E>>,
    ports: OpenPorts,
}

impl<E: Environment> Service<E> {
    /// Service for `identity`.
    pub fn new(identity: Arc<IdentityKeyPair>, env: E, config: ServiceConfig) -> Self {
        let local = PeerId(identity.public_bytes());
        info!(peer = %local, "service started");
        Self { identity, local, env, config, tunnels: BTreeMap::new(), ports: OpenPorts::new() }
    }

    /// Our identity.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Tunnel toward `peer`, if one exists.
    pub fn tunnel(&self, peer: &PeerId) -> Option<&Tunnel<E>> {
        self.tunnels.get(peer)
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of open ports.
    pub fn open_port_count(&self) -> usize {
        self.ports.len()
    }

    /// Open a channel to `port` on `dest`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::SelfTunnel` if `dest` is our own identity
    pub fn open(
        &mut self,
        dest: PeerId,
        port: &[u8],
        options: ChannelOptions,
        now: Instant<E>,
    ) -> Result<(ChannelHandle, Vec<ServiceAction>), ServiceError> {
        let hash = PortHash(port_hash(port, dest.as_bytes()));
        let tunnel = self.resolve_tunnel(dest)?;
        let (ctn, actions) = tunnel.open_channel(hash, options, now);
        Ok((ChannelHandle { peer: dest, ctn }, self.finish(dest, actions)))
    }

    /// Listen on `port`. Loose channels waiting for it are bound now.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortAlreadyOpen` if we already listen on `port`
    pub fn accept(&mut self, port: &[u8], now: Instant<E>) -> Result<Vec<ServiceAction>, ServiceError> {
        let hash = PortHash(port_hash(port, self.local.as_bytes()));
        let listener = self.ports.open(hash)?;
        debug!(port = ?hash, ?listener, "port opened");

        let peers: Vec<PeerId> = self.tunnels.keys().copied().collect();
        let mut out = Vec::new();
        for peer in peers {
            if let Some(tunnel) = self.tunnels.get_mut(&peer) {
                let actions = tunnel.bind_loose(&hash, now);
                out.extend(self.finish(peer, actions));
            }
        }
        Ok(out)
    }

    /// Stop listening on `port`. Channels already bound stay open.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortNotOpen` if we do not listen on `port`
    pub fn close_port(&mut self, port: &[u8]) -> Result<(), ServiceError> {
        let hash = PortHash(port_hash(port, self.local.as_bytes()));
        let listener = self.ports.close(&hash)?;
        debug!(port = ?hash, ?listener, "port closed");
        Ok(())
    }

    /// Submit a payload.
    ///
    /// # Errors
    ///
    /// - `SendRefused::UnknownChannel` if `handle` names no live channel
    /// - Whatever the channel refuses
    pub fn send(
        &mut self,
        handle: ChannelHandle,
        payload: Bytes,
        now: Instant<E>,
    ) -> Result<(Credit, Vec<ServiceAction>), SendRefused> {
        let tunnel =
            self.tunnels.get_mut(&handle.peer).ok_or(SendRefused::UnknownChannel(handle.ctn))?;
        let (credit, actions) = tunnel.send(handle.ctn, payload, now)?;
        Ok((credit, self.finish(handle.peer, actions)))
    }

    /// The application is ready for the next payload on `handle`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::UnknownChannel` if `handle` names no live channel
    pub fn acknowledge_received(
        &mut self,
        handle: ChannelHandle,
        now: Instant<E>,
    ) -> Result<Vec<ServiceAction>, ServiceError> {
        let tunnel = self.live_tunnel(handle)?;
        let actions = tunnel.acknowledge_received(handle.ctn, now);
        Ok(self.finish(handle.peer, actions))
    }

    /// Destroy `handle`. No `Closed` event follows for it.
    ///
    /// # Errors
    ///
    /// - `ServiceError::UnknownChannel` if `handle` names no live channel
    pub fn destroy(
        &mut self,
        handle: ChannelHandle,
        now: Instant<E>,
    ) -> Result<Vec<ServiceAction>, ServiceError> {
        let tunnel = self.live_tunnel(handle)?;
        let actions = tunnel.destroy_channel(handle.ctn, now);
        Ok(self.finish(handle.peer, actions))
    }

    /// Re-key the tunnel toward `peer`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::UnknownPeer` if there is no tunnel toward `peer`
    pub fn rekey(&mut self, peer: PeerId, now: Instant<E>) -> Result<Vec<ServiceAction>, ServiceError> {
        let tunnel = self.tunnels.get_mut(&peer).ok_or(ServiceError::UnknownPeer(peer))?;
        let actions = tunnel.rekey(now);
        Ok(self.finish(peer, actions))
    }

    /// Tear down the tunnel toward `peer` and all its channels.
    pub fn destroy_tunnel(&mut self, peer: PeerId) -> Vec<ServiceAction> {
        match self.tunnels.get_mut(&peer) {
            Some(tunnel) => {
                let actions = tunnel.destroy();
                self.finish(peer, actions)
            },
            None => Vec::new(),
        }
    }

    /// A connection toward `peer` can take a message.
    ///
    /// Creates the tunnel if needed, which lets the initiator start the key
    /// exchange as soon as the peer is reachable.
    ///
    /// # Errors
    ///
    /// - `ServiceError::SelfTunnel` if `peer` is our own identity
    pub fn on_connection_ready(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        now: Instant<E>,
    ) -> Result<Vec<ServiceAction>, ServiceError> {
        let tunnel = self.resolve_tunnel(peer)?;
        let actions = tunnel.on_connection_ready(connection, now);
        Ok(self.finish(peer, actions))
    }

    /// A connection toward `peer` cannot take messages for now.
    pub fn on_connection_unready(&mut self, peer: PeerId, connection: ConnectionId) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.on_connection_busy(connection);
        }
    }

    /// A connection toward `peer` is gone.
    pub fn on_connection_lost(&mut self, peer: PeerId, connection: ConnectionId) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.on_connection_lost(connection);
        }
    }

    /// Bytes arrived from `peer`.
    pub fn on_message_received(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        bytes: &[u8],
        now: Instant<E>,
    ) -> Vec<ServiceAction> {
        if peer == self.local {
            warn!(peer = %peer, "message claims to come from ourselves, dropping");
            return Vec::new();
        }
        let ports = &self.ports;
        let tunnel = match self.tunnels.entry(peer) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                match Tunnel::new(
                    Arc::clone(&self.identity),
                    peer,
                    self.env.clone(),
                    self.config.tunnel.clone(),
                ) {
                    Ok(tunnel) => entry.insert(tunnel),
                    Err(error) => {
                        warn!(peer = %peer, %error, "cannot create tunnel");
                        return Vec::new();
                    },
                }
            },
        };
        let actions = tunnel.on_message_received(connection, bytes, ports, now);
        self.finish(peer, actions)
    }

    /// Fire every timer due at `now`, in every tunnel.
    pub fn poll_timers(&mut self, now: Instant<E>) -> Vec<ServiceAction> {
        let due: Vec<PeerId> = self
            .tunnels
            .iter()
            .filter(|(_, tunnel)| tunnel.next_deadline().is_some_and(|at| at <= now))
            .map(|(peer, _)| *peer)
            .collect();

        let mut out = Vec::new();
        for peer in due {
            if let Some(tunnel) = self.tunnels.get_mut(&peer) {
                let actions = tunnel.poll_timers(now);
                out.extend(self.finish(peer, actions));
            }
        }
        out
    }

    /// Earliest timer across all tunnels.
    pub fn next_deadline(&self) -> Option<Instant<E>> {
        self.tunnels.values().filter_map(Tunnel::next_deadline).min()
    }

    fn resolve_tunnel(&mut self, peer: PeerId) -> Result<&mut Tunnel<E>, ServiceError> {
        if peer == self.local {
            return Err(ServiceError::SelfTunnel(peer));
        }
        match self.tunnels.entry(peer) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let tunnel = Tunnel::new(
                    Arc::clone(&self.identity),
                    peer,
                    self.env.clone(),
                    self.config.tunnel.clone(),
                )?;
                Ok(entry.insert(tunnel))
            },
        }
    }

    fn live_tunnel(&mut self, handle: ChannelHandle) -> Result<&mut Tunnel<E>, ServiceError> {
        self.tunnels
            .get_mut(&handle.peer)
            .filter(|tunnel| tunnel.channel(handle.ctn).is_some())
            .ok_or(ServiceError::UnknownChannel(handle))
    }

    /// Tag tunnel actions with `peer`; drop the tunnel once it is destroyed.
    fn finish(&mut self, peer: PeerId, actions: Vec<TunnelAction>) -> Vec<ServiceAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            out.push(match action {
                TunnelAction::Transmit { connection, bytes } => {
                    ServiceAction::Transmit { peer, connection, bytes }
                },
                TunnelAction::RequestConnection => ServiceAction::RequestConnection { peer },
                TunnelAction::Event(event) => ServiceAction::Event(event),
                TunnelAction::KeyExchangeStalled => ServiceAction::KeyExchangeStalled { peer },
                TunnelAction::Destroyed => {
                    self.tunnels.remove(&peer);
                    info!(peer = %peer, "tunnel removed");
                    ServiceAction::TunnelDestroyed { peer }
                },
            });
        }
        out
    }
}

impl<E: Environment> std::fmt::Debug for Service<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("local", &self.local)
            .field("tunnels", &self.tunnels.len())
            .field("ports", &self.ports.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;
    use crate::testing::TestEnv;

    fn service(secret: u8) -> Service<TestEnv> {
        let identity = Arc::new(IdentityKeyPair::from_secret_bytes([secret; 32]));
        Service::new(identity, TestEnv::new(u64::from(secret)), ServiceConfig::default())
    }

    #[test]
    fn tunnel_to_self_is_refused() {
        let mut alice = service(1);
        let me = alice.local_peer();
        let result = alice.open(me, b"echo", ChannelOptions::reliable(), StdInstant::now());
        assert_eq!(result.unwrap_err(), ServiceError::SelfTunnel(me));
        assert_eq!(alice.tunnel_count(), 0);
    }

    #[test]
    fn open_creates_tunnel_and_requests_connection() {
        let mut alice = service(1);
        let bob = service(2).local_peer();

        let (handle, actions) =
            alice.open(bob, b"echo", ChannelOptions::reliable(), StdInstant::now()).unwrap();
        assert_eq!(handle.peer, bob);
        assert!(actions.contains(&ServiceAction::RequestConnection { peer: bob }));
        assert_eq!(alice.tunnel_count(), 1);
    }

    #[test]
    fn port_open_close_lifecycle() {
        let mut alice = service(1);
        let now = StdInstant::now();
        alice.accept(b"echo", now).unwrap();
        assert_eq!(alice.accept(b"echo", now), Err(ServiceError::PortAlreadyOpen));
        alice.close_port(b"echo").unwrap();
        assert_eq!(alice.close_port(b"echo"), Err(ServiceError::PortNotOpen));
        assert_eq!(alice.open_port_count(), 0);
    }

    #[test]
    fn calls_on_unknown_handles_are_refused() {
        let mut alice = service(1);
        let handle = ChannelHandle { peer: service(2).local_peer(), ctn: cadet_proto::ChannelNumber(4) };
        let now = StdInstant::now();

        assert_eq!(
            alice.send(handle, Bytes::from_static(b"x"), now).unwrap_err(),
            SendRefused::UnknownChannel(handle.ctn)
        );
        assert_eq!(alice.destroy(handle, now), Err(ServiceError::UnknownChannel(handle)));
        assert_eq!(alice.rekey(handle.peer, now), Err(ServiceError::UnknownPeer(handle.peer)));
    }

    #[test]
    fn destroyed_tunnel_is_dropped() {
        let mut alice = service(1);
        let bob = service(2).local_peer();
        alice.open(bob, b"echo", ChannelOptions::reliable(), StdInstant::now()).unwrap();

        let actions = alice.destroy_tunnel(bob);
        assert!(actions.contains(&ServiceAction::TunnelDestroyed { peer: bob }));
        assert!(actions.iter().any(|a| matches!(a, ServiceAction::Event(ChannelEvent::Closed { .. }))));
        assert!(alice.tunnel(&bob).is_none());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        use ciborium::Value;

        let text = |s: &str| Value::Text(s.to_owned());
        let partial = Value::Map(vec![(
            text("tunnel"),
            Value::Map(vec![
                (text("channel"), Value::Map(vec![(text("max_pending_messages"), Value::Integer(8u32.into()))])),
                (text("key_exchange"), Value::Map(vec![(text("rekey_after_frames"), Value::Integer(100u64.into()))])),
            ]),
        )]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&partial, &mut bytes).unwrap();

        let config: ServiceConfig = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(config.tunnel.channel.max_pending_messages, 8);
        assert_eq!(config.tunnel.key_exchange.rekey_after_frames, Some(100));
        assert_eq!(config.tunnel.channel.loose_timeout, crate::channel::ChannelConfig::default().loose_timeout);
        assert_eq!(config.tunnel.idle_destroy_delay, TunnelConfig::default().idle_destroy_delay);
    }
}
