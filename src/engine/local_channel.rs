//! src/engine/local_channel.rs
//!
//! Local-channel and self-node-announcement policy: decides when to sign and
//! emit a fresh `channel_update` or `node_announcement`, driven by
//! configuration changes, the enable/disable toggle, and the keep-alive
//! sweep timer.

use crate::domain::{ChainHash, NodeId};
use crate::error::Result;
use crate::routing::RoutingState;
use crate::signer::Signer;
use crate::wire::{ChannelFlags, ChannelUpdate, MessageFlags, NodeAnnouncement};

/// Fee/expiry parameters for one direction of a local channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelParams {
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
}

/// Builds and signs a `channel_update` for our side of `scid`. The timestamp
/// is always strictly greater than whatever we last published for this
/// direction, so that peers (and our own routing table) never discard it as
/// stale.
pub async fn build_channel_update(
    signer: &dyn Signer,
    chain_hash: ChainHash,
    scid: crate::domain::ShortChannelId,
    direction: u8,
    now: u32,
    last_timestamp: Option<u32>,
    params: ChannelParams,
    disabled: bool,
) -> Result<ChannelUpdate> {
    let timestamp = match last_timestamp {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    let mut channel_flags = if direction == 1 {
        ChannelFlags::DIRECTION
    } else {
        ChannelFlags::empty()
    };
    if disabled {
        channel_flags |= ChannelFlags::DISABLED;
    }
    let mut unsigned = ChannelUpdate {
        signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
        chain_hash,
        short_channel_id: scid,
        timestamp,
        message_flags: MessageFlags::OPTION_CHANNEL_HTLC_MAX,
        channel_flags,
        cltv_expiry_delta: params.cltv_expiry_delta,
        htlc_minimum_msat: params.htlc_minimum_msat,
        fee_base_msat: params.fee_base_msat,
        fee_proportional_millionths: params.fee_proportional_millionths,
        htlc_maximum_msat: params.htlc_maximum_msat,
    };
    unsigned.signature = signer.sign(&unsigned.signing_body()).await?;
    Ok(unsigned)
}

/// Builds and signs our own `node_announcement`. Callers must check
/// `RoutingState::node_announcement_redundant` first and skip sending if it
/// would carry no new information, and must not call this at all before we
/// have at least one announced channel (an unreferenced node announcement
/// is ignored network-wide).
pub async fn build_node_announcement(
    signer: &dyn Signer,
    node_id: NodeId,
    now: u32,
    last_timestamp: Option<u32>,
    features: Vec<u8>,
    rgb_color: [u8; 3],
    alias: [u8; 32],
    addresses: Vec<std::net::SocketAddr>,
) -> Result<NodeAnnouncement> {
    let timestamp = match last_timestamp {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    let mut unsigned = NodeAnnouncement {
        signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
        features,
        timestamp,
        node_id,
        rgb_color,
        alias,
        addresses,
    };
    unsigned.signature = signer.sign(&unsigned.signing_body()).await?;
    Ok(unsigned)
}

/// A half-channel is due for a keep-alive refresh once `keepalive_interval`
/// seconds have elapsed since its last update, even absent any substantive
/// change (this is what prevents other nodes from pruning it as stale).
pub fn needs_keepalive(last_timestamp: u32, now: u32, keepalive_interval_secs: u32) -> bool {
    now.saturating_sub(last_timestamp) >= keepalive_interval_secs
}

/// Runs the periodic keep-alive sweep over every local channel, returning
/// the `(scid, direction)` pairs whose `channel_update` is due for refresh.
/// Channels flagged `local_disabled` are skipped; their removal is handled
/// by `RoutingState::route_prune`, not by reissuing updates.
pub fn keepalive_candidates(
    routing: &RoutingState,
    self_id: NodeId,
    now: u32,
    keepalive_interval_secs: u32,
) -> Vec<(crate::domain::ShortChannelId, u8)> {
    let mut due = Vec::new();
    for scid in routing.local_channels(self_id) {
        let Some(channel) = routing.get_channel(scid) else { continue };
        if channel.local_disabled {
            continue;
        }
        let Some(direction) = channel.direction_of(self_id) else { continue };
        let due_for_refresh = match &channel.half_channels[direction as usize] {
            Some(half) => needs_keepalive(half.last_timestamp, now, keepalive_interval_secs),
            None => true,
        };
        if due_for_refresh {
            due.push((scid, direction));
        }
    }
    due
}
