//! End-to-end scenarios over the simulated network.
//!
//! Each test builds a small network of services with fixed identities and a
//! fixed seed, drives it through the public service API and checks what the
//! applications at both ends observe.

use std::time::Duration;

use bytes::Bytes;
use cadet_core::{
    ChannelEvent, ChannelHandle, ChannelState, CloseReason, KeyExchangeConfig, KxState,
    SendRefused, ServiceConfig, TunnelConfig,
};
use cadet_crypto::Role;
use cadet_harness::{InvariantRegistry, NetworkConfig, NetworkSnapshot, SimNetwork};
use cadet_proto::{ChannelOptions, MAX_PAYLOAD_SIZE, PeerId};
use tracing_subscriber::EnvFilter;

const PORT: &[u8] = b"cadet-test";
const SETTLE: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two nodes, returned as `(initiator, responder)` of their tunnel.
fn network(config: ServiceConfig) -> (SimNetwork, PeerId, PeerId) {
    init_tracing();
    let mut net = SimNetwork::new(0xCADE7, NetworkConfig::default(), config);
    let alice = net.add_node(1);
    let bob = net.add_node(2);
    if Role::from_identities(&alice.0, &bob.0) == Some(Role::Initiator) {
        (net, alice, bob)
    } else {
        (net, bob, alice)
    }
}

/// Channel from `from` to `to` that has completed its open.
fn open_channel(net: &mut SimNetwork, from: PeerId, to: PeerId) -> ChannelHandle {
    net.accept(to, PORT).unwrap();
    let handle = net.open(from, to, PORT, ChannelOptions::reliable()).unwrap();
    net.run_for(SETTLE);
    let events = net.node(&from).unwrap().events();
    assert!(events.contains(&ChannelEvent::Opened { handle }), "channel did not open: {events:?}");
    handle
}

fn remote(handle: ChannelHandle, local: PeerId) -> ChannelHandle {
    ChannelHandle { peer: local, ctn: handle.ctn }
}

fn payloads(items: &[&'static [u8]]) -> Vec<Bytes> {
    items.iter().copied().map(Bytes::from_static).collect()
}

fn assert_invariants(net: &SimNetwork) {
    let snapshot = NetworkSnapshot::capture(net);
    if let Err(violations) = InvariantRegistry::standard().check_all(&snapshot) {
        panic!("invariants violated: {violations:?}");
    }
}

#[test]
fn early_payload_is_delivered_once_and_credit_gates_the_next() {
    // Either end may open first; the responder opens here to exercise its hello.
    let (mut net, initiator, responder) = network(ServiceConfig::default());
    let (alice, bob) = (responder, initiator);
    net.accept(bob, PORT).unwrap();

    let handle = net.open(alice, bob, PORT, ChannelOptions::reliable()).unwrap();
    net.send(alice, handle, Bytes::from_static(b"hello")).unwrap();
    assert_eq!(
        net.send(alice, handle, Bytes::from_static(b"second")),
        Err(SendRefused::NotReady)
    );

    net.run_for(SETTLE);

    let at_bob = remote(handle, alice);
    let bob_node = net.node(&bob).unwrap();
    assert!(bob_node.events().iter().any(|e| matches!(
        e,
        ChannelEvent::Incoming { handle, .. } if *handle == at_bob
    )));
    assert_eq!(bob_node.payloads(at_bob), payloads(&[b"hello"]));

    let alice_events = net.node(&alice).unwrap().events();
    assert!(alice_events.contains(&ChannelEvent::Opened { handle }));
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ChannelEvent::Credit { handle: h, available } if *h == handle && *available > 0
    )));

    net.send(alice, handle, Bytes::from_static(b"second")).unwrap();
    net.run_for(SETTLE);
    assert_eq!(net.node(&bob).unwrap().payloads(at_bob), payloads(&[b"hello", b"second"]));
    assert_invariants(&net);
}

#[test]
fn out_of_order_arrival_is_delivered_in_sequence() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, alice, bob);
    let at_bob = remote(handle, alice);

    net.hold(alice, bob);
    for payload in payloads(&[b"zero", b"one", b"two"]) {
        net.send(alice, handle, payload).unwrap();
        net.run_for(Duration::from_millis(1));
    }
    net.stop_holding(alice, bob);
    assert_eq!(net.held().len(), 3);

    // Arrival order 0, 2, 1.
    net.release(&[0]);
    assert_eq!(net.node(&bob).unwrap().payloads(at_bob), payloads(&[b"zero"]));

    net.release(&[1]);
    let bob_node = net.node(&bob).unwrap();
    assert_eq!(bob_node.payloads(at_bob), payloads(&[b"zero"]));
    let channel = bob_node.service().tunnel(&alice).unwrap().channel(handle.ctn).unwrap();
    assert_eq!(channel.queued_received(), 1);

    net.release(&[0]);
    assert_eq!(net.node(&bob).unwrap().payloads(at_bob), payloads(&[b"zero", b"one", b"two"]));

    net.run_for(SETTLE);
    let channel = net.node(&alice).unwrap().service().tunnel(&bob).unwrap().channel(handle.ctn);
    assert_eq!(channel.unwrap().pending_messages(), 0);
    assert_invariants(&net);
}

#[test]
fn unclaimed_channel_is_discarded_silently() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = net.open(alice, bob, PORT, ChannelOptions::reliable()).unwrap();
    net.run_for(Duration::from_millis(500));

    let tunnel = net.node(&bob).unwrap().service().tunnel(&alice).unwrap();
    assert_eq!(tunnel.channel(handle.ctn).map(|c| c.state()), Some(ChannelState::Loose));

    // Keep further open retries from recreating it.
    net.block(alice, bob);
    net.run_for(TunnelConfig::default().channel.loose_timeout + Duration::from_secs(5));

    let tunnel = net.node(&bob).unwrap().service().tunnel(&alice).unwrap();
    assert_eq!(tunnel.channel_count(), 0);
    assert_eq!(tunnel.stats().destroys_echoed, 0);

    let alice_node = net.node(&alice).unwrap();
    assert!(!alice_node.events().iter().any(|e| matches!(e, ChannelEvent::Closed { .. })));
    let channel = alice_node.service().tunnel(&bob).unwrap().channel(handle.ctn).unwrap();
    assert_eq!(channel.state(), ChannelState::OpenSent);
}

#[test]
fn loose_channel_binds_when_port_opens() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = net.open(alice, bob, PORT, ChannelOptions::reliable()).unwrap();
    net.send(alice, handle, Bytes::from_static(b"early")).unwrap();
    net.run_for(Duration::from_secs(1));
    assert!(net.node(&bob).unwrap().payloads(remote(handle, alice)).is_empty());

    net.accept(bob, PORT).unwrap();
    net.run_for(Duration::from_secs(5));

    assert!(net.node(&alice).unwrap().events().contains(&ChannelEvent::Opened { handle }));
    assert_eq!(net.node(&bob).unwrap().payloads(remote(handle, alice)), payloads(&[b"early"]));
}

#[test]
fn rekey_keeps_old_keys_for_frames_in_flight() {
    let (mut net, initiator, responder) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, initiator, responder);
    let at_responder = remote(handle, initiator);
    net.send(initiator, handle, Bytes::from_static(b"warmup")).unwrap();
    net.run_for(SETTLE);

    let digest = |net: &SimNetwork, node: PeerId, peer: PeerId| {
        let tunnel = net.node(&node).unwrap().service().tunnel(&peer).unwrap();
        tunnel.key_exchange().verified().root_key_digest()
    };
    let initiator_before = digest(&net, initiator, responder);
    let responder_before = digest(&net, responder, initiator);

    net.hold(initiator, responder);
    net.send(initiator, handle, Bytes::from_static(b"old keys")).unwrap();
    net.run_for(Duration::from_millis(1));
    net.rekey(initiator, responder).unwrap();
    net.run_for(Duration::from_millis(1));
    net.stop_holding(initiator, responder);
    assert_eq!(net.held().len(), 2);

    // The exchange overtakes the frame sealed before it.
    net.release(&[1, 0]);
    let tunnel = net.node(&responder).unwrap().service().tunnel(&initiator).unwrap();
    assert!(tunnel.key_exchange().has_unverified());
    assert_eq!(tunnel.stats().auth_failures, 0);
    assert_eq!(
        net.node(&responder).unwrap().payloads(at_responder),
        payloads(&[b"warmup", b"old keys"])
    );

    net.run_for(SETTLE);
    let tunnel = net.node(&responder).unwrap().service().tunnel(&initiator).unwrap();
    assert!(!tunnel.key_exchange().has_unverified());
    assert_eq!(tunnel.kx_state(), KxState::Ready);
    assert_ne!(digest(&net, initiator, responder), initiator_before);
    assert_ne!(digest(&net, responder, initiator), responder_before);
    assert!(!net.node(&initiator).unwrap().service().tunnel(&responder).unwrap().key_exchange().rekey_pending());

    net.send(initiator, handle, Bytes::from_static(b"new keys")).unwrap();
    net.run_for(SETTLE);
    assert_eq!(
        net.node(&responder).unwrap().payloads(at_responder),
        payloads(&[b"warmup", b"old keys", b"new keys"])
    );
}

#[test]
fn rekeys_after_configured_frame_count() {
    let config = ServiceConfig {
        tunnel: TunnelConfig {
            key_exchange: KeyExchangeConfig {
                rekey_after_frames: Some(6),
                ..KeyExchangeConfig::default()
            },
            ..TunnelConfig::default()
        },
    };
    let (mut net, initiator, responder) = network(config);
    let handle = open_channel(&mut net, initiator, responder);
    let kx_sent = |net: &SimNetwork| {
        net.node(&initiator).unwrap().service().tunnel(&responder).unwrap().stats().kx_sent
    };
    let before = kx_sent(&net);

    let sent: Vec<Bytes> = (0..30).map(|i| Bytes::from(format!("message-{i}"))).collect();
    for payload in &sent {
        for _ in 0..1_000 {
            match net.send(initiator, handle, payload.clone()) {
                Ok(_) => break,
                Err(SendRefused::WindowFull { .. }) => net.run_for(Duration::from_millis(50)),
                Err(other) => panic!("unexpected refusal: {other}"),
            }
        }
        assert_invariants(&net);
    }
    net.run_for(SETTLE);

    assert_eq!(net.node(&responder).unwrap().payloads(remote(handle, initiator)), sent);
    assert!(kx_sent(&net) >= before + 3, "expected several re-keys");
    let responder_tunnel = net.node(&responder).unwrap().service().tunnel(&initiator).unwrap();
    assert_eq!(responder_tunnel.stats().auth_failures, 0);
    assert!(!responder_tunnel.key_exchange().has_unverified());
}

#[test]
fn restarted_peer_recovers_tunnel() {
    let (mut net, initiator, responder) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, initiator, responder);

    net.restart(responder);
    net.send(initiator, handle, Bytes::from_static(b"into the void")).unwrap();
    net.run_for(Duration::from_secs(10));

    let initiator_node = net.node(&initiator).unwrap();
    assert!(
        initiator_node
            .events()
            .contains(&ChannelEvent::Closed { handle, reason: CloseReason::RemoteDestroy })
    );

    let fresh = open_channel(&mut net, initiator, responder);
    net.send(initiator, fresh, Bytes::from_static(b"hello again")).unwrap();
    net.run_for(SETTLE);
    assert_eq!(
        net.node(&responder).unwrap().payloads(remote(fresh, initiator)),
        payloads(&[b"hello again"])
    );
}

#[test]
fn unreachable_peer_reports_stalled_exchange() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    net.block(alice, bob);
    net.open(alice, bob, PORT, ChannelOptions::reliable()).unwrap();
    net.run_for(Duration::from_secs(30 * 60));

    assert!(net.node(&alice).unwrap().stalled().contains(&bob));
    assert!(net.node(&bob).unwrap().service().tunnel(&alice).is_none());
}

#[test]
fn idle_tunnels_are_torn_down() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, alice, bob);
    net.send(alice, handle, Bytes::from_static(b"bye")).unwrap();
    net.run_for(SETTLE);

    net.destroy(alice, handle).unwrap();
    net.run_for(TunnelConfig::default().idle_destroy_delay + Duration::from_secs(30));

    for (node, peer) in [(alice, bob), (bob, alice)] {
        let n = net.node(&node).unwrap();
        assert!(n.service().tunnel(&peer).is_none());
        assert!(n.destroyed_tunnels().contains(&peer));
    }
    assert!(net.node(&bob).unwrap().events().contains(&ChannelEvent::Closed {
        handle: remote(handle, alice),
        reason: CloseReason::RemoteDestroy,
    }));
}

#[test]
fn destroy_racing_inbound_data_still_delivers_pending_payload() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, alice, bob);
    let at_bob = remote(handle, alice);

    net.hold(alice, bob);
    net.send(alice, handle, Bytes::from_static(b"x")).unwrap();
    net.run_for(Duration::from_millis(1));
    net.destroy(alice, handle).unwrap();

    // Bob's payload reaches Alice while hers is still in flight
    net.send(bob, at_bob, Bytes::from_static(b"y")).unwrap();
    net.run_for(Duration::from_millis(100));
    let alice_node = net.node(&alice).unwrap();
    assert!(alice_node.payloads(handle).is_empty());
    let channel = alice_node.service().tunnel(&bob).unwrap().channel(handle.ctn).unwrap();
    assert!(channel.is_destroying());
    assert_eq!(channel.pending_messages(), 1);

    net.stop_holding(alice, bob);
    let all: Vec<usize> = (0..net.held().len()).collect();
    net.release(&all);
    net.run_for(SETTLE);

    let bob_node = net.node(&bob).unwrap();
    assert_eq!(bob_node.payloads(at_bob), payloads(&[b"x"]));
    assert!(
        bob_node
            .events()
            .contains(&ChannelEvent::Closed { handle: at_bob, reason: CloseReason::RemoteDestroy })
    );
    assert_eq!(net.node(&alice).unwrap().service().tunnel(&bob).unwrap().channel_count(), 0);
    assert_invariants(&net);
}

#[test]
fn destroy_before_open_completes_still_delivers_early_data() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    net.accept(bob, PORT).unwrap();
    let handle = net.open(alice, bob, PORT, ChannelOptions::reliable()).unwrap();
    net.send(alice, handle, Bytes::from_static(b"hello")).unwrap();
    net.destroy(alice, handle).unwrap();

    let channel = net.node(&alice).unwrap().service().tunnel(&bob).unwrap().channel(handle.ctn);
    assert!(channel.is_some_and(|c| c.is_destroying()));

    net.run_for(SETTLE);

    let at_bob = remote(handle, alice);
    let bob_node = net.node(&bob).unwrap();
    assert_eq!(bob_node.payloads(at_bob), payloads(&[b"hello"]));
    assert!(
        bob_node
            .events()
            .contains(&ChannelEvent::Closed { handle: at_bob, reason: CloseReason::RemoteDestroy })
    );

    let alice_node = net.node(&alice).unwrap();
    assert!(!alice_node.events().contains(&ChannelEvent::Opened { handle }));
    assert_eq!(alice_node.service().tunnel(&bob).unwrap().channel_count(), 0);
    assert_invariants(&net);
}

#[test]
fn payloads_are_bounded_by_the_frame_size() {
    let (mut net, alice, bob) = network(ServiceConfig::default());
    let handle = open_channel(&mut net, alice, bob);

    let oversized = Bytes::from(vec![0x42; MAX_PAYLOAD_SIZE + 1]);
    assert_eq!(
        net.send(alice, handle, oversized),
        Err(SendRefused::PayloadTooLarge { size: MAX_PAYLOAD_SIZE + 1, max: MAX_PAYLOAD_SIZE })
    );

    let largest = Bytes::from(vec![0x42; MAX_PAYLOAD_SIZE]);
    net.send(alice, handle, largest.clone()).unwrap();
    net.run_for(SETTLE);

    assert_eq!(net.node(&bob).unwrap().payloads(remote(handle, alice)), vec![largest]);
    let channel = net.node(&alice).unwrap().service().tunnel(&bob).unwrap().channel(handle.ctn);
    assert_eq!(channel.unwrap().pending_messages(), 0);
    assert_invariants(&net);
}
