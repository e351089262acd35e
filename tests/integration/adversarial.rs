//! tests/integration/adversarial.rs
//!
//! Wire-level misbehavior a real peer's QUIC connection might throw at us,
//! exercised through `RawPeer` against a real running node rather than the
//! engine directly.

use crate::common::harness::{ephemeral_addr, RawPeer, TestNode};
use channel_gossip::engine::MAX_SANE_PONG_BYTES;
use channel_gossip::wire::{GossipMessage, Ping};
use std::time::Duration;

/// A garbage frame that doesn't `bincode`-decode as any `GossipMessage` is
/// dropped at the transport layer and never reaches the engine -- the
/// connection and peer session survive it, unlike a protocol violation
/// discovered after decoding.
#[tokio::test]
async fn a_malformed_frame_is_dropped_without_breaking_the_connection() {
    let mut a = TestNode::spawn(|_| {}).await.expect("spawn node a");
    let counterparty = channel_gossip::domain::Identity::new();
    let raw_addr = ephemeral_addr();

    a.register_peer(counterparty.node_id, raw_addr, false, false)
        .await
        .expect("register counterparty with a");
    let raw = RawPeer::connect(a.p2p_addr, raw_addr).await.expect("raw peer dial a");

    raw.send_raw(&[0xff, 0x00, 0x13, 0x37, 0xde, 0xad]).await.expect("send garbage frame");

    // The connection should still be good for a normal ping/pong round trip.
    raw.send(&GossipMessage::Ping(Ping { num_pong_bytes: 8, padding_len: 0 }))
        .await
        .expect("send ping after garbage frame");

    let reply = raw.recv_one(Duration::from_secs(2)).await.expect("pong should still arrive");
    match reply {
        GossipMessage::Pong(pong) => assert_eq!(pong.padding.len(), 8),
        other => panic!("expected a Pong, got {other:?}"),
    }

    raw.close().await;
}

/// Preserved "possibly buggy" original behavior at the raw wire level: a
/// `ping` requesting `num_pong_bytes >= MAX_SANE_PONG_BYTES` gets no `pong`
/// at all, because the peer considers it insane and never replies.
#[tokio::test]
async fn a_ping_above_the_sane_byte_threshold_gets_no_wire_reply() {
    let mut a = TestNode::spawn(|_| {}).await.expect("spawn node a");
    let counterparty = channel_gossip::domain::Identity::new();
    let raw_addr = ephemeral_addr();

    a.register_peer(counterparty.node_id, raw_addr, false, false)
        .await
        .expect("register counterparty with a");
    let raw = RawPeer::connect(a.p2p_addr, raw_addr).await.expect("raw peer dial a");

    raw.send(&GossipMessage::Ping(Ping { num_pong_bytes: MAX_SANE_PONG_BYTES, padding_len: 0 }))
        .await
        .expect("send an insane ping");

    let result = raw.recv_one(Duration::from_millis(500)).await;
    assert!(result.is_err(), "no pong should ever arrive for an insane-sized ping request, got {result:?}");

    raw.close().await;
}
