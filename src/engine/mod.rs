//! src/engine/mod.rs
//!
//! The `Engine`: owns the routing state and every live peer session, and
//! implements the per-peer message dispatch table (component B) that ties
//! together the query protocol, broadcast pacer, and local-channel policy.

pub mod local_channel;
pub mod pacer;
pub mod peer;
pub mod query;

use crate::config::Config;
use crate::domain::{ChainHash, NodeId, ShortChannelId};
use crate::error::{Error, Result};
use crate::routing::RoutingState;
use crate::signer::Signer;
use crate::wire::{GossipMessage, Ping, Pong};
use peer::{PeerFeatures, PeerSession};
use query::{ChannelRangeQueryState, ScidQueryState};
use std::collections::HashMap;
use std::sync::Arc;

/// BOLT #1: a `ping` whose `num_pong_bytes` is at or above this threshold
/// MUST be ignored outright -- no `pong` is sent back at all. Below it, a
/// `pong` with exactly `num_pong_bytes` of padding is required.
pub const MAX_SANE_PONG_BYTES: u16 = 65532;

/// One immediate effect of handling an inbound message: something to send
/// back to the same peer, a side effect the orchestrator must carry out
/// (asking control to confirm a funding output), or notice that a `pong`
/// arrived so a deferred control-initiated `ping` reply can be completed.
pub enum EngineEffect {
    Reply(GossipMessage),
    RequestTxout(ShortChannelId),
    PongReceived { padding_len: usize },
}

pub struct Engine {
    pub self_id: NodeId,
    config: Config,
    pub routing: RoutingState,
    signer: Arc<dyn Signer>,
    peers: HashMap<NodeId, PeerSession>,
}

impl Engine {
    pub fn new(self_id: NodeId, config: Config, signer: Arc<dyn Signer>) -> Self {
        let chain_hash = config.chain_hash;
        Self {
            self_id,
            config,
            routing: RoutingState::new(chain_hash),
            signer,
            peers: HashMap::new(),
        }
    }

    pub fn chain_hash(&self) -> ChainHash {
        self.config.chain_hash
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable access for the orchestrator's developer-mode control commands
    /// (`DevSetMaxScidsEncodeSize`, `DevSuppressGossip`), which mutate
    /// `Config` rather than a process-global, per §4.F/§4.H.
    #[cfg(feature = "developer")]
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Registers a newly connected peer, evicting any prior session for the
    /// same node id. Returns the messages to send immediately as part of
    /// session setup (a `gossip_timestamp_filter` for peers with the
    /// `gossip_queries` feature).
    pub fn new_peer(&mut self, id: NodeId, features: PeerFeatures) -> Vec<GossipMessage> {
        // A `gossip_queries`-capable peer gets nothing broadcast until it
        // sends its own `gossip_timestamp_filter` (which resets the cursor);
        // `initial_routing_sync` only matters for legacy peers that never
        // send one.
        let initial_cursor = if features.gossip_queries {
            u64::MAX
        } else if features.initial_routing_sync {
            self.routing.broadcast_log().genesis_cursor()
        } else {
            self.routing.broadcast_log().tip_cursor()
        };
        self.peers.insert(id, PeerSession::new(id, features, initial_cursor));

        if features.gossip_queries {
            vec![GossipMessage::GossipTimestampFilter(crate::wire::GossipTimestampFilter {
                chain_hash: self.config.chain_hash,
                first_timestamp: 0,
                timestamp_range: u32::MAX,
            })]
        } else {
            Vec::new()
        }
    }

    pub fn remove_peer(&mut self, id: &NodeId) {
        self.peers.remove(id);
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerSession> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &NodeId) -> Option<&mut PeerSession> {
        self.peers.get_mut(id)
    }

    /// Produces the next paced message for `id`, or `None`.
    pub fn pump_peer(&mut self, id: &NodeId) -> Option<GossipMessage> {
        let suppress = self.config.developer.suppress_gossip;
        let peer = self.peers.get_mut(id)?;
        pacer::pump(peer, &self.routing, suppress)
    }

    /// The main per-peer dispatch table (component B). Messages whose chain
    /// hash doesn't match ours are silently ignored, not errors.
    pub fn handle_wire_message(
        &mut self,
        from: NodeId,
        message: GossipMessage,
    ) -> Result<Vec<EngineEffect>> {
        match message {
            GossipMessage::ChannelAnnouncement(ann) => {
                if ann.chain_hash != self.config.chain_hash {
                    return Ok(Vec::new());
                }
                let body = ann.signing_body();
                crate::domain::verify_signature(&ann.node_id_1, &body, &ann.node_signature_1)?;
                crate::domain::verify_signature(&ann.node_id_2, &body, &ann.node_signature_2)?;
                crate::domain::verify_signature(&ann.bitcoin_key_1, &body, &ann.bitcoin_signature_1)?;
                crate::domain::verify_signature(&ann.bitcoin_key_2, &body, &ann.bitcoin_signature_2)?;
                let scid = ann.short_channel_id;
                if self.routing.handle_pending_channel_announcement(ann) {
                    Ok(vec![EngineEffect::RequestTxout(scid)])
                } else {
                    Ok(Vec::new())
                }
            }
            GossipMessage::ChannelUpdate(update) => {
                if update.chain_hash != self.config.chain_hash {
                    return Ok(Vec::new());
                }
                let signer_node = self.update_signer_node_id(&update)?;
                crate::domain::verify_signature(&signer_node, &update.signing_body(), &update.signature)?;
                self.routing.apply_channel_update(update);
                Ok(Vec::new())
            }
            GossipMessage::NodeAnnouncement(ann) => {
                crate::domain::verify_signature(&ann.node_id, &ann.signing_body(), &ann.signature)?;
                self.routing.apply_node_announcement(ann);
                Ok(Vec::new())
            }
            GossipMessage::QueryShortChannelIds(q) => {
                if q.chain_hash != self.config.chain_hash {
                    return Ok(Vec::new());
                }
                let peer = self
                    .peers
                    .get_mut(&from)
                    .ok_or_else(|| Error::Internal("query from unknown peer".to_string()))?;
                if peer.has_in_flight_scid_query() {
                    return Err(Error::PeerProtocolViolation(
                        "query_short_channel_ids received while one is already in flight".to_string(),
                    ));
                }
                peer.scid_query = Some(ScidQueryState::new(q.chain_hash, q.short_channel_ids, true));
                Ok(Vec::new())
            }
            GossipMessage::ReplyShortChannelIdsEnd(end) => {
                let peer = self
                    .peers
                    .get_mut(&from)
                    .ok_or_else(|| Error::Internal("reply from unknown peer".to_string()))?;
                if peer.outstanding_scid_queries == 0 {
                    return Err(Error::PeerProtocolViolation(
                        "reply_short_channel_ids_end with no outstanding query".to_string(),
                    ));
                }
                peer.outstanding_scid_queries -= 1;
                let _ = end.full_information;
                Ok(Vec::new())
            }
            GossipMessage::QueryChannelRange(q) => {
                if q.chain_hash != self.config.chain_hash {
                    return Ok(Vec::new());
                }
                let max_body = self
                    .config
                    .developer
                    .max_scids_encode_size
                    .unwrap_or(query::MAX_REPLY_CHANNEL_RANGE_BODY_BYTES);
                match query::build_channel_range_replies(
                    &self.routing,
                    q.chain_hash,
                    q.first_blocknum,
                    q.number_of_blocks,
                    true,
                    max_body,
                ) {
                    Ok(replies) => Ok(replies
                        .into_iter()
                        .map(|r| EngineEffect::Reply(GossipMessage::ReplyChannelRange(r)))
                        .collect()),
                    // Overflow: logged and abandoned, not a protocol violation --
                    // the original daemon neither replies nor disconnects the peer.
                    Err(Error::ChannelRangeOverflow) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
            GossipMessage::ReplyChannelRange(reply) => {
                let peer = self
                    .peers
                    .get_mut(&from)
                    .ok_or_else(|| Error::Internal("reply from unknown peer".to_string()))?;
                let state = peer.channel_range_query.as_mut().ok_or_else(|| {
                    Error::PeerProtocolViolation(
                        "reply_channel_range with no outstanding query".to_string(),
                    )
                })?;
                state.apply_reply(&reply)?;
                if state.is_complete() {
                    peer.channel_range_query = None;
                }
                Ok(Vec::new())
            }
            GossipMessage::GossipTimestampFilter(filter) => {
                let (ts_min, ts_max) = filter.window();
                let peer = self
                    .peers
                    .get_mut(&from)
                    .ok_or_else(|| Error::Internal("filter from unknown peer".to_string()))?;
                peer.set_timestamp_filter(ts_min, ts_max);
                Ok(Vec::new())
            }
            GossipMessage::Ping(ping) => Ok(Self::build_pong(&ping)
                .into_iter()
                .map(|pong| EngineEffect::Reply(GossipMessage::Pong(pong)))
                .collect()),
            GossipMessage::Pong(pong) => {
                let peer = self
                    .peers
                    .get_mut(&from)
                    .ok_or_else(|| Error::Internal("pong from unknown peer".to_string()))?;
                if peer.outstanding_pings == 0 {
                    return Err(Error::PeerProtocolViolation("unsolicited pong".to_string()));
                }
                peer.outstanding_pings -= 1;
                Ok(vec![EngineEffect::PongReceived { padding_len: pong.padding.len() }])
            }
            GossipMessage::Error(err) => {
                tracing::warn!(%from, data = ?String::from_utf8_lossy(&err.data), "peer reported a protocol error");
                Ok(Vec::new())
            }
        }
    }

    /// BOLT #1's `handle_ping`: a `num_pong_bytes` at or beyond
    /// `MAX_SANE_PONG_BYTES` means the ping is ignored entirely, no `pong`
    /// sent. Below it, a `pong` of exactly that many padding bytes is owed.
    /// `outstanding_pings` is untouched here -- it only tracks pings *we*
    /// initiated via the control `ping` command, answered by this peer's
    /// future `pong`, not pings a peer sends to us.
    fn build_pong(ping: &Ping) -> Option<Pong> {
        if ping.num_pong_bytes >= MAX_SANE_PONG_BYTES {
            return None;
        }
        Some(Pong { padding: vec![0u8; ping.num_pong_bytes as usize] })
    }

    /// Initiates a control-requested outbound `ping`. If `num_pong_bytes`
    /// is at or beyond `MAX_SANE_PONG_BYTES` no `pong` will ever arrive, so
    /// the caller must answer control immediately rather than incrementing
    /// `outstanding_pings` and waiting.
    pub fn send_ping(
        &mut self,
        peer_id: NodeId,
        num_pong_bytes: u16,
        padding_len: u16,
    ) -> Result<(GossipMessage, bool)> {
        let peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| Error::ControlRequest(format!("unknown peer {peer_id:?}")))?;
        let expects_reply = num_pong_bytes < MAX_SANE_PONG_BYTES;
        if expects_reply {
            peer.outstanding_pings += 1;
        }
        Ok((
            GossipMessage::Ping(Ping { num_pong_bytes, padding_len }),
            expects_reply,
        ))
    }

    /// Resolves which node id's signature should cover `update`: whichever
    /// endpoint the direction bit selects.
    fn update_signer_node_id(&self, update: &crate::wire::ChannelUpdate) -> Result<NodeId> {
        let channel = self
            .routing
            .get_channel(update.short_channel_id)
            .ok_or_else(|| Error::UnknownChannel(format!("{:?}", update.short_channel_id)))?;
        let (n1, n2) = channel.node_ids();
        Ok(if update.channel_flags.direction_bit() { n2 } else { n1 })
    }

    /// Starts an outbound `query_channel_range`, recording the state needed
    /// to assemble its (possibly many) replies. Returns the request message
    /// to send.
    pub fn start_channel_range_query(
        &mut self,
        peer_id: NodeId,
        first_blocknum: u32,
        number_of_blocks: u32,
    ) -> Result<GossipMessage> {
        let peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| Error::Internal("unknown peer".to_string()))?;
        if peer.has_in_flight_range_query() {
            return Err(Error::Internal(
                "a channel_range query is already in flight for this peer".to_string(),
            ));
        }
        let request = crate::wire::QueryChannelRange {
            chain_hash: self.config.chain_hash,
            first_blocknum,
            number_of_blocks,
        };
        peer.channel_range_query = Some(ChannelRangeQueryState::new(request.clone()));
        Ok(GossipMessage::QueryChannelRange(request))
    }
}
