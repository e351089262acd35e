//! tests/integration/topology.rs
//!
//! Three real `App` instances wired into a line (`A -- B -- C`), plus a
//! `RawPeer` standing in for a channel counterparty the orchestrator never
//! spawned itself. Exercises the broadcast pacer's propagation across hops
//! and the peer-disconnect-disables-local-channel path in `app.rs`.

use crate::common::harness::{ephemeral_addr, wait_for, RawPeer, TestNode};
use channel_gossip::control::{ChannelHalfSummary, Command, Reply};
use channel_gossip::domain::{ChainHash, Identity, ShortChannelId};
use channel_gossip::wire::{ChannelAnnouncement, GossipMessage};
use std::time::Duration;

/// Announces a channel between a funding identity the test owns (`node_id_1`,
/// so direction 0 is its own half) and a counterparty it never exchanged
/// keys with. `local` signs its side with its own key; `a` later proves it
/// controls the channel over the control socket via `LocalChannelUpdate`,
/// which signs with the node's own engine key independent of `node_id_1`,
/// rather than by literally being `node_id_1` itself.
fn announce(chain_hash: ChainHash, scid: ShortChannelId, local: &Identity, counterparty: &Identity) -> ChannelAnnouncement {
    let mut ann = ChannelAnnouncement {
        node_signature_1: dummy_sig(),
        node_signature_2: dummy_sig(),
        bitcoin_signature_1: dummy_sig(),
        bitcoin_signature_2: dummy_sig(),
        features: vec![],
        chain_hash,
        short_channel_id: scid,
        node_id_1: local.node_id,
        node_id_2: counterparty.node_id,
        bitcoin_key_1: local.node_id,
        bitcoin_key_2: counterparty.node_id,
    };
    let body = ann.signing_body();
    ann.node_signature_1 = local.sign_bytes(&body);
    ann.bitcoin_signature_1 = ann.node_signature_1;
    ann.node_signature_2 = counterparty.sign_bytes(&body);
    ann.bitcoin_signature_2 = ann.node_signature_2;
    ann
}

fn dummy_sig() -> ed25519_dalek::Signature {
    ed25519_dalek::Signature::from_bytes(&[0u8; 64])
}

async fn channels_for(node: &mut TestNode, scid: ShortChannelId) -> anyhow::Result<Vec<ChannelHalfSummary>> {
    match node.command(Command::GetChannels { scid: Some(scid) }).await? {
        Reply::Channels(channels) => Ok(channels),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

/// Announces a channel funded by a freshly-generated identity (not `local`'s
/// own node id, which this test process has no signing access to) and a
/// `RawPeer` counterparty, drains the resulting funding lookup, then has
/// `local` sign its own half over the control socket so the half-channel
/// actually shows up in `GetChannels`.
async fn announce_and_sign_local_half(local: &mut TestNode, scid: ShortChannelId, counterparty: &Identity, raw: &RawPeer) {
    let chain_hash = channel_gossip::config::Config::default().chain_hash;
    let funding_identity = Identity::new();
    raw.send(&GossipMessage::ChannelAnnouncement(announce(chain_hash, scid, &funding_identity, counterparty)))
        .await
        .expect("send channel_announcement");

    // Give the inbound task time to request and receive the funding txout
    // before we ask the node to sign its own half.
    tokio::time::sleep(Duration::from_millis(200)).await;
    local.command(Command::GetIncomingChannels).await.expect("drain pending txout request");
    tokio::time::sleep(Duration::from_millis(100)).await;

    local
        .command(Command::LocalChannelUpdate {
            scid,
            direction: 0,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1,
            fee_base_msat: 1000,
            fee_proportional_millionths: 10,
            htlc_maximum_msat: 1_000_000,
            enabled: true,
        })
        .await
        .expect("local node signs its own half-channel policy");
}

#[tokio::test]
async fn a_channel_announced_at_one_end_propagates_across_a_three_hop_line() {
    let mut a = TestNode::spawn(|_| {}).await.expect("spawn node a");
    let mut b = TestNode::spawn(|_| {}).await.expect("spawn node b");
    let mut c = TestNode::spawn(|_| {}).await.expect("spawn node c");

    a.befriend(&b).await.expect("a learns about b");
    b.befriend(&a).await.expect("b learns about a");
    b.befriend(&c).await.expect("b learns about c");
    c.befriend(&b).await.expect("c learns about b");

    let scid = ShortChannelId::new(700, 0, 0);
    let counterparty = Identity::new();
    let raw_addr = ephemeral_addr();

    // Register the counterparty's address with A before it ever dials in --
    // the orchestrator drops inbound wire traffic from unregistered peers.
    a.register_peer(counterparty.node_id, raw_addr, false, false)
        .await
        .expect("register counterparty with a");
    let raw = RawPeer::connect(a.p2p_addr, raw_addr).await.expect("raw peer dial a");

    announce_and_sign_local_half(&mut a, scid, &counterparty, &raw).await;

    let a_channels = wait_for(Duration::from_secs(2), || {
        let a = &mut a;
        async move {
            let channels = channels_for(a, scid).await?;
            Ok(if channels.is_empty() { None } else { Some(channels) })
        }
    })
    .await
    .expect("a should see its own freshly-signed half-channel");
    assert_eq!(a_channels[0].scid, scid);

    wait_for(Duration::from_secs(5), || {
        let b = &mut b;
        async move {
            let channels = channels_for(b, scid).await?;
            Ok(if channels.is_empty() { None } else { Some(()) })
        }
    })
    .await
    .expect("the channel should propagate from a to b");

    wait_for(Duration::from_secs(5), || {
        let c = &mut c;
        async move {
            let channels = channels_for(c, scid).await?;
            Ok(if channels.is_empty() { None } else { Some(()) })
        }
    })
    .await
    .expect("the channel should propagate from b to c over the second hop");

    raw.close().await;
}

/// Mirrors `conn_event_task`'s `ConnectionEvent::PeerDisconnected` handling:
/// when a peer that is the other end of one of our local channels drops its
/// connection, that channel is flagged `local_disabled`, not deleted outright.
#[tokio::test]
async fn a_peer_disconnect_disables_the_shared_local_channel() {
    let mut a = TestNode::spawn(|_| {}).await.expect("spawn node a");

    let scid = ShortChannelId::new(701, 0, 0);
    let counterparty = Identity::new();
    let raw_addr = ephemeral_addr();

    a.register_peer(counterparty.node_id, raw_addr, false, false)
        .await
        .expect("register counterparty with a");
    let raw = RawPeer::connect(a.p2p_addr, raw_addr).await.expect("raw peer dial a");

    announce_and_sign_local_half(&mut a, scid, &counterparty, &raw).await;

    let channels = wait_for(Duration::from_secs(2), || {
        let a = &mut a;
        async move {
            let channels = channels_for(a, scid).await?;
            Ok(if channels.is_empty() { None } else { Some(channels) })
        }
    })
    .await
    .expect("a should see its own half-channel before the disconnect");
    assert!(!channels[0].local_disabled);

    raw.close().await;

    let channels = wait_for(Duration::from_secs(2), || {
        let a = &mut a;
        async move {
            let channels = channels_for(a, scid).await?;
            Ok(if channels.first().map(|c| c.local_disabled).unwrap_or(false) {
                Some(channels)
            } else {
                None
            })
        }
    })
    .await
    .expect("the half-channel should become local_disabled once the peer drops");
    assert!(channels[0].local_disabled);
}
