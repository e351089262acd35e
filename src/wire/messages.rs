//! src/wire/messages.rs
//!
//! Gossip message bodies exchanged between peers. Field layout follows the
//! public BOLT-style gossip messages (signature, chain hash, short channel
//! id, flags, fee/expiry parameters); encoding is `bincode`, not the exact
//! TLV wire format, since the framing itself is out of scope here.

use crate::domain::{ChainHash, NodeId, ShortChannelId};
use bitflags::bitflags;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::scid_codec::{decode_scids, encode_scids};

/// Bounds the envelope-tagged scid list on the wire; generous relative to
/// `transport`'s 1 MiB whole-message cap, which is the real backstop.
const SCID_LIST_MAX_BYTES: usize = 1_024 * 1_024;

bitflags! {
    /// `message_flags` on a `channel_update`: bit 0 indicates
    /// `htlc_maximum_msat` is present and meaningful.
    ///
    /// `Serialize`/`Deserialize` come from bitflags's own `serde` feature.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const OPTION_CHANNEL_HTLC_MAX = 0b0000_0001;
    }
}

bitflags! {
    /// `channel_flags` on a `channel_update`: bit 0 selects which side of the
    /// channel this update describes (the "direction" bit), bit 1 marks the
    /// direction disabled.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelFlags: u8 {
        const DIRECTION = 0b0000_0001;
        const DISABLED  = 0b0000_0010;
    }
}

impl ChannelFlags {
    pub fn direction_bit(self) -> bool {
        self.contains(ChannelFlags::DIRECTION)
    }

    pub fn is_disabled(self) -> bool {
        self.contains(ChannelFlags::DISABLED)
    }
}

/// Announces a new public channel and binds it to the two Bitcoin funding
/// keys and two node ids that control it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    pub node_signature_1: Signature,
    pub node_signature_2: Signature,
    pub bitcoin_signature_1: Signature,
    pub bitcoin_signature_2: Signature,
    pub features: Vec<u8>,
    pub chain_hash: ChainHash,
    pub short_channel_id: ShortChannelId,
    pub node_id_1: NodeId,
    pub node_id_2: NodeId,
    pub bitcoin_key_1: NodeId,
    pub bitcoin_key_2: NodeId,
}

impl ChannelAnnouncement {
    /// The body all four signatures cover: everything but the signatures
    /// themselves.
    pub fn signing_body(&self) -> Vec<u8> {
        bincode::serialize(&(
            &self.features,
            self.chain_hash,
            self.short_channel_id,
            self.node_id_1,
            self.node_id_2,
            self.bitcoin_key_1,
            self.bitcoin_key_2,
        ))
        .expect("ChannelAnnouncement fields are always serializable")
    }
}

/// Advertises routing parameters (fees, CLTV delta, HTLC bounds) for one
/// direction of a channel. May be reissued at any time to change fees or
/// as a keep-alive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub signature: Signature,
    pub chain_hash: ChainHash,
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: MessageFlags,
    pub channel_flags: ChannelFlags,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
}

impl ChannelUpdate {
    /// The byte string the signature is computed over: every field except
    /// the signature itself. Shared between signing and verification so the
    /// two can never drift apart.
    pub fn signing_body(&self) -> Vec<u8> {
        bincode::serialize(&(
            self.chain_hash,
            self.short_channel_id,
            self.timestamp,
            self.message_flags,
            self.channel_flags,
            self.cltv_expiry_delta,
            self.htlc_minimum_msat,
            self.fee_base_msat,
            self.fee_proportional_millionths,
            self.htlc_maximum_msat,
        ))
        .expect("ChannelUpdate fields are always serializable")
    }
}

/// Advertises a node's extra metadata (alias, colour, addresses). Ignored
/// for nodes not already referenced by a known channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub signature: Signature,
    pub features: Vec<u8>,
    pub timestamp: u32,
    pub node_id: NodeId,
    pub rgb_color: [u8; 3],
    pub alias: [u8; 32],
    pub addresses: Vec<SocketAddr>,
}

impl NodeAnnouncement {
    pub fn signing_body(&self) -> Vec<u8> {
        bincode::serialize(&(
            &self.features,
            self.timestamp,
            self.node_id,
            self.rgb_color,
            self.alias,
            &self.addresses,
        ))
        .expect("NodeAnnouncement fields are always serializable")
    }
}

/// Requests the full gossip records for a set of short channel ids.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryShortChannelIds {
    pub chain_hash: ChainHash,
    pub short_channel_ids: Vec<ShortChannelId>,
}

#[derive(Serialize, Deserialize)]
struct QueryShortChannelIdsWire {
    chain_hash: ChainHash,
    encoded_short_channel_ids: Vec<u8>,
}

impl Serialize for QueryShortChannelIds {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded =
            encode_scids(&self.short_channel_ids, SCID_LIST_MAX_BYTES).map_err(serde::ser::Error::custom)?;
        QueryShortChannelIdsWire { chain_hash: self.chain_hash, encoded_short_channel_ids: encoded }
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryShortChannelIds {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = QueryShortChannelIdsWire::deserialize(deserializer)?;
        let short_channel_ids =
            decode_scids(&wire.encoded_short_channel_ids, SCID_LIST_MAX_BYTES).map_err(serde::de::Error::custom)?;
        Ok(Self { chain_hash: wire.chain_hash, short_channel_ids })
    }
}

/// Terminates the multi-message reply to a `query_short_channel_ids`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyShortChannelIdsEnd {
    pub chain_hash: ChainHash,
    /// Whether the reply is known-complete (`1`) or may be missing entries
    /// because our own sync isn't finished yet (`0`).
    pub full_information: u8,
}

/// Requests the short channel ids known within a block range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryChannelRange {
    pub chain_hash: ChainHash,
    pub first_blocknum: u32,
    pub number_of_blocks: u32,
}

/// One block-range reply to a `query_channel_range`; the complete response
/// may be split into several of these to respect the wire size budget.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyChannelRange {
    pub chain_hash: ChainHash,
    pub first_blocknum: u32,
    pub number_of_blocks: u32,
    pub full_information: u8,
    pub short_channel_ids: Vec<ShortChannelId>,
}

#[derive(Serialize, Deserialize)]
struct ReplyChannelRangeWire {
    chain_hash: ChainHash,
    first_blocknum: u32,
    number_of_blocks: u32,
    full_information: u8,
    encoded_short_channel_ids: Vec<u8>,
}

impl Serialize for ReplyChannelRange {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded =
            encode_scids(&self.short_channel_ids, SCID_LIST_MAX_BYTES).map_err(serde::ser::Error::custom)?;
        ReplyChannelRangeWire {
            chain_hash: self.chain_hash,
            first_blocknum: self.first_blocknum,
            number_of_blocks: self.number_of_blocks,
            full_information: self.full_information,
            encoded_short_channel_ids: encoded,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReplyChannelRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ReplyChannelRangeWire::deserialize(deserializer)?;
        let short_channel_ids =
            decode_scids(&wire.encoded_short_channel_ids, SCID_LIST_MAX_BYTES).map_err(serde::de::Error::custom)?;
        Ok(Self {
            chain_hash: wire.chain_hash,
            first_blocknum: wire.first_blocknum,
            number_of_blocks: wire.number_of_blocks,
            full_information: wire.full_information,
            short_channel_ids,
        })
    }
}

/// Installs a timestamp window on the peer connection: only `channel_update`
/// and `node_announcement` with `ts_min <= timestamp <= ts_max` are
/// broadcast to this peer afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipTimestampFilter {
    pub chain_hash: ChainHash,
    pub first_timestamp: u32,
    pub timestamp_range: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub num_pong_bytes: u16,
    pub padding_len: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub padding: Vec<u8>,
}

/// Sent immediately before the connection is dropped for a peer protocol
/// violation, carrying a human-readable description of what went wrong.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub data: Vec<u8>,
}

/// Union of every gossip-relevant message a peer session may send or
/// receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    ChannelAnnouncement(ChannelAnnouncement),
    ChannelUpdate(ChannelUpdate),
    NodeAnnouncement(NodeAnnouncement),
    QueryShortChannelIds(QueryShortChannelIds),
    ReplyShortChannelIdsEnd(ReplyShortChannelIdsEnd),
    QueryChannelRange(QueryChannelRange),
    ReplyChannelRange(ReplyChannelRange),
    GossipTimestampFilter(GossipTimestampFilter),
    Ping(Ping),
    Pong(Pong),
    Error(ErrorMessage),
}

impl GossipTimestampFilter {
    /// Computes the inclusive `[ts_min, ts_max]` window: `ts_max` is
    /// `first_timestamp + timestamp_range - 1`, saturating at both ends.
    pub fn window(&self) -> (u32, u32) {
        let ts_min = self.first_timestamp;
        let ts_max = ts_min.saturating_add(self.timestamp_range).saturating_sub(1);
        (ts_min, ts_max)
    }
}
