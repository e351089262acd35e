//! src/control.rs
//!
//! The control dispatcher (component F): the command set the node's main
//! process issues over a length-prefixed `bincode` frame protocol on a Unix
//! domain socket. The engine never speaks first on this channel except for
//! `gossip_get_txout`, which rides the same framing as an unsolicited
//! `Event`.

use crate::domain::{NodeId, ShortChannelId};
use crate::engine::{Engine, EngineEffect};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;

/// Every command the main process may issue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    GetNodes { id: Option<NodeId> },
    GetChannels { scid: Option<ShortChannelId> },
    GetRoute {
        src: NodeId,
        dst: NodeId,
        amount_msat: u64,
        riskfactor: u32,
        final_cltv: u16,
        fuzz: u16,
        seed: u64,
    },
    /// Queues an outbound `ping` to `peer_id`. See `Reply::Pong` for the
    /// `num_pong_bytes >= 65532` edge case.
    Ping { peer_id: NodeId, num_pong_bytes: u16, len: u16 },
    GetIncomingChannels,
    GetChannelPeer { scid: ShortChannelId },
    RoutingFailure { scid: ShortChannelId, direction: u8 },
    MarkChannelUnroutable { scid: ShortChannelId, direction: u8 },
    OutpointSpent { scid: ShortChannelId },
    LocalChannelClose { scid: ShortChannelId },
    /// Asks us to (re)sign and publish a `channel_update` for one of our own
    /// half-channels, e.g. after a fee change or an enabled/disabled flip.
    LocalChannelUpdate {
        scid: ShortChannelId,
        direction: u8,
        cltv_expiry_delta: u16,
        htlc_minimum_msat: u64,
        fee_base_msat: u32,
        fee_proportional_millionths: u32,
        htlc_maximum_msat: u64,
        enabled: bool,
    },

    #[cfg(feature = "developer")]
    DevForceQueryShortChannelIds { peer_id: NodeId, scids: Vec<ShortChannelId> },
    #[cfg(feature = "developer")]
    DevForceGossipTimestampFilter { peer_id: NodeId, first_timestamp: u32, timestamp_range: u32 },
    #[cfg(feature = "developer")]
    DevForceQueryChannelRange { peer_id: NodeId, first_blocknum: u32, number_of_blocks: u32 },
    #[cfg(feature = "developer")]
    DevSetMaxScidsEncodeSize { max_bytes: Option<usize> },
    #[cfg(feature = "developer")]
    DevSuppressGossip { suppress: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub timestamp: Option<u32>,
    pub features: Vec<u8>,
    pub addresses: Vec<SocketAddr>,
    pub alias: [u8; 32],
    pub rgb_color: [u8; 3],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelHalfSummary {
    pub scid: ShortChannelId,
    pub source: NodeId,
    pub destination: NodeId,
    pub capacity_sat: Option<u64>,
    pub direction: u8,
    pub public: bool,
    pub local_disabled: bool,
    pub enabled: bool,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub htlc_maximum_msat: u64,
    pub last_timestamp: u32,
}

/// Every reply the engine may send back over the control socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Nodes(Vec<NodeSummary>),
    Channels(Vec<ChannelHalfSummary>),
    Route(Option<Vec<ShortChannelId>>),
    /// `(ok, byteslen)`: `byteslen` is the padding length of the `pong` we
    /// actually received, or `0` when no `pong` was ever expected.
    Pong { ok: bool, byteslen: u16 },
    IncomingChannels(Vec<ChannelHalfSummary>),
    ChannelPeer(Option<NodeId>),
    Ok,
    Error(String),
}

/// FIFO of deferred `ping` replies per peer, fulfilled as `pong`s arrive.
/// Mirrors the original's `peer->num_pings_outstanding` plus the implicit
/// FIFO ordering of a single control connection.
#[derive(Default)]
pub struct PendingPings {
    by_peer: HashMap<NodeId, VecDeque<oneshot::Sender<Reply>>>,
}

impl PendingPings {
    pub fn push(&mut self, peer_id: NodeId, reply_tx: oneshot::Sender<Reply>) {
        self.by_peer.entry(peer_id).or_default().push_back(reply_tx);
    }

    /// Called when `engine::EngineEffect::PongReceived` fires for `peer_id`;
    /// completes the oldest outstanding control `ping` for that peer, if any.
    pub fn fulfil(&mut self, peer_id: NodeId, padding_len: usize) {
        if let Some(queue) = self.by_peer.get_mut(&peer_id) {
            if let Some(reply_tx) = queue.pop_front() {
                let _ = reply_tx.send(Reply::Pong { ok: true, byteslen: padding_len as u16 });
            }
        }
    }
}

/// Answers a control command that doesn't require waiting on a future wire
/// event. `ping` below the BOLT `num_pong_bytes` threshold is the one
/// command that instead registers in `pending` and returns `None`, leaving
/// the reply to be sent later by the orchestrator when the `pong` arrives.
///
/// Commands that produce a message for the wire (`Ping`, the developer
/// forced-query commands) push it onto `outbound` rather than sending it
/// themselves -- this module only ever touches the engine, never the
/// transport; the orchestrator drains `outbound` and resolves each peer id
/// to an address itself.
pub async fn dispatch(
    engine: &mut Engine,
    command: Command,
    pending: &mut PendingPings,
    reply_tx: oneshot::Sender<Reply>,
    now: u32,
    outbound: &mut Vec<(NodeId, crate::wire::GossipMessage)>,
) {
    match command {
        Command::GetNodes { id } => {
            let nodes = list_nodes(engine, id);
            let _ = reply_tx.send(Reply::Nodes(nodes));
        }
        Command::GetChannels { scid } => {
            let channels = list_channels(engine, scid);
            let _ = reply_tx.send(Reply::Channels(channels));
        }
        Command::GetRoute { src, dst, .. } => {
            let route = engine.routing.find_route(src, dst);
            let _ = reply_tx.send(Reply::Route(route));
        }
        Command::Ping { peer_id, num_pong_bytes, len } => match engine.send_ping(peer_id, num_pong_bytes, len) {
            Ok((ping, expects_reply)) if expects_reply => {
                outbound.push((peer_id, ping));
                pending.push(peer_id, reply_tx);
            }
            Ok((ping, _no_reply_expected)) => {
                // num_pong_bytes >= 65532: no pong will ever arrive, so
                // control is answered immediately with byteslen 0, not the
                // size of the (never-received) pong. Preserved verbatim. The
                // ping itself is still sent.
                outbound.push((peer_id, ping));
                let _ = reply_tx.send(Reply::Pong { ok: true, byteslen: 0 });
            }
            Err(_) => {
                let _ = reply_tx.send(Reply::Pong { ok: false, byteslen: 0 });
            }
        },
        Command::GetIncomingChannels => {
            let channels = list_channels(engine, None)
                .into_iter()
                .filter(|c| c.public && c.enabled && !c.local_disabled)
                .collect();
            let _ = reply_tx.send(Reply::IncomingChannels(channels));
        }
        Command::GetChannelPeer { scid } => {
            let peer = engine.routing.get_channel_peer(scid, engine.self_id);
            let _ = reply_tx.send(Reply::ChannelPeer(peer));
        }
        Command::RoutingFailure { scid, direction } | Command::MarkChannelUnroutable { scid, direction } => {
            engine.routing.mark_channel_unroutable(scid, direction);
            let _ = reply_tx.send(Reply::Ok);
        }
        Command::OutpointSpent { scid } => {
            engine.routing.outpoint_spent(scid);
            let _ = reply_tx.send(Reply::Ok);
        }
        Command::LocalChannelClose { scid } => {
            engine.routing.local_channel_close(scid);
            let _ = reply_tx.send(Reply::Ok);
        }
        Command::LocalChannelUpdate {
            scid,
            direction,
            cltv_expiry_delta,
            htlc_minimum_msat,
            fee_base_msat,
            fee_proportional_millionths,
            htlc_maximum_msat,
            enabled,
        } => {
            let existing = engine
                .routing
                .get_channel(scid)
                .and_then(|c| c.half_channels[direction as usize].as_ref());
            let params = crate::engine::local_channel::ChannelParams {
                cltv_expiry_delta,
                htlc_minimum_msat,
                fee_base_msat,
                fee_proportional_millionths,
                htlc_maximum_msat,
            };
            // Regenerate only if control actually changed something: a
            // routing parameter, a disabled-to-enabled transition, or this
            // is the channel's first ever update (nothing public to compare
            // against yet, so it must always be sent).
            let params_changed = existing.map_or(true, |h| {
                h.update.cltv_expiry_delta != params.cltv_expiry_delta
                    || h.update.htlc_minimum_msat != params.htlc_minimum_msat
                    || h.update.fee_base_msat != params.fee_base_msat
                    || h.update.fee_proportional_millionths != params.fee_proportional_millionths
                    || h.update.htlc_maximum_msat != params.htlc_maximum_msat
            });
            let enabling = existing.map_or(false, |h| !h.enabled) && enabled;
            let not_yet_published = existing.is_none();

            let reply = if params_changed || enabling || not_yet_published {
                let last_timestamp = existing.map(|h| h.last_timestamp);
                let chain_hash = engine.chain_hash();
                let signer = engine.signer().clone();
                let built = crate::engine::local_channel::build_channel_update(
                    signer.as_ref(),
                    chain_hash,
                    scid,
                    direction,
                    now,
                    last_timestamp,
                    params,
                    !enabled,
                )
                .await;
                match built {
                    Ok(update) => {
                        engine.routing.apply_channel_update(update);
                        Reply::Ok
                    }
                    Err(e) => Reply::Error(e.to_string()),
                }
            } else {
                Reply::Ok
            };
            let _ = reply_tx.send(reply);
        }

        #[cfg(feature = "developer")]
        Command::DevForceQueryShortChannelIds { peer_id, scids } => {
            let chain_hash = engine.chain_hash();
            let reply = if let Some(peer) = engine.peer_mut(&peer_id) {
                peer.outstanding_scid_queries += 1;
                let query = crate::wire::QueryShortChannelIds {
                    chain_hash,
                    short_channel_ids: scids,
                };
                outbound.push((peer_id, crate::wire::GossipMessage::QueryShortChannelIds(query)));
                Reply::Ok
            } else {
                Reply::Error(format!("unknown peer {peer_id:?}"))
            };
            let _ = reply_tx.send(reply);
        }
        #[cfg(feature = "developer")]
        Command::DevForceGossipTimestampFilter { peer_id, first_timestamp, timestamp_range } => {
            let reply = if let Some(peer) = engine.peer_mut(&peer_id) {
                let ts_max = first_timestamp.saturating_add(timestamp_range);
                peer.set_timestamp_filter(first_timestamp, ts_max);
                Reply::Ok
            } else {
                Reply::Error(format!("unknown peer {peer_id:?}"))
            };
            let _ = reply_tx.send(reply);
        }
        #[cfg(feature = "developer")]
        Command::DevForceQueryChannelRange { peer_id, first_blocknum, number_of_blocks } => {
            let reply = match engine.start_channel_range_query(peer_id, first_blocknum, number_of_blocks) {
                Ok(msg) => {
                    outbound.push((peer_id, msg));
                    Reply::Ok
                }
                Err(e) => Reply::Error(e.to_string()),
            };
            let _ = reply_tx.send(reply);
        }
        #[cfg(feature = "developer")]
        Command::DevSetMaxScidsEncodeSize { max_bytes } => {
            engine.config_mut().developer.max_scids_encode_size = max_bytes;
            let _ = reply_tx.send(Reply::Ok);
        }
        #[cfg(feature = "developer")]
        Command::DevSuppressGossip { suppress } => {
            engine.config_mut().developer.suppress_gossip = suppress;
            let _ = reply_tx.send(Reply::Ok);
        }
    }
}

fn list_nodes(engine: &Engine, id: Option<NodeId>) -> Vec<NodeSummary> {
    let summarize = |node_id: NodeId, ann: Option<&crate::wire::NodeAnnouncement>| NodeSummary {
        id: node_id,
        timestamp: ann.map(|a| a.timestamp),
        features: ann.map(|a| a.features.clone()).unwrap_or_default(),
        addresses: ann.map(|a| a.addresses.clone()).unwrap_or_default(),
        alias: ann.map(|a| a.alias).unwrap_or([0u8; 32]),
        rgb_color: ann.map(|a| a.rgb_color).unwrap_or([0u8; 3]),
    };
    match id {
        Some(id) => engine
            .routing
            .get_node(&id)
            .into_iter()
            .map(|n| summarize(id, n.announcement.as_ref()))
            .collect(),
        None => engine
            .routing
            .local_channels(engine.self_id)
            .into_iter()
            .filter_map(|scid| engine.routing.get_channel(scid))
            .flat_map(|c| {
                let (n1, n2) = c.node_ids();
                [n1, n2]
            })
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|id| summarize(id, engine.routing.get_node(&id).and_then(|n| n.announcement.as_ref())))
            .collect(),
    }
}

fn list_channels(engine: &Engine, scid: Option<ShortChannelId>) -> Vec<ChannelHalfSummary> {
    let scids: Vec<ShortChannelId> = match scid {
        Some(scid) => vec![scid],
        None => engine.routing.local_channels(engine.self_id),
    };
    let mut out = Vec::new();
    for scid in scids {
        let Some(channel) = engine.routing.get_channel(scid) else { continue };
        let (n1, n2) = channel.node_ids();
        for (direction, (source, destination)) in [(0u8, (n1, n2)), (1u8, (n2, n1))] {
            let Some(half) = &channel.half_channels[direction as usize] else { continue };
            out.push(ChannelHalfSummary {
                scid,
                source,
                destination,
                capacity_sat: channel.capacity_sat,
                direction,
                public: true,
                local_disabled: channel.local_disabled,
                enabled: half.enabled,
                fee_base_msat: half.update.fee_base_msat,
                fee_proportional_millionths: half.update.fee_proportional_millionths,
                cltv_expiry_delta: half.update.cltv_expiry_delta,
                htlc_minimum_msat: half.update.htlc_minimum_msat,
                htlc_maximum_msat: half.update.htlc_maximum_msat,
                last_timestamp: half.last_timestamp,
            });
        }
    }
    out
}

/// Everything the main process may send down the control socket: the
/// ordinary command set, plus the reply to a `GetTxout` event the engine
/// itself raised -- the one case the engine speaks first on this channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FromMaster {
    Command(Command),
    /// Answers a previously-sent `ToMaster::GetTxout`: `satoshis` is `None`
    /// if the output doesn't exist or is already spent.
    TxoutReply { scid: ShortChannelId, satoshis: Option<u64> },
}

/// Everything the engine may send up the control socket: ordinary replies,
/// plus the unsolicited `gossip_get_txout` request that confirms a pending
/// `channel_announcement`'s funding output before it's allowed onto the
/// broadcast log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ToMaster {
    Reply(Reply),
    GetTxout { scid: ShortChannelId },
}

/// Reads one length-prefixed `bincode` frame: a 4-byte big-endian length
/// followed by that many bytes of payload. A frame whose length exceeds
/// this bound is itself treated as a control protocol violation -- the
/// main process is trusted, so any malformed command is fatal (tier 4).
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

pub async fn read_from_master(stream: &mut UnixStream) -> Result<FromMaster> {
    let len = read_frame_len(stream).await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| Error::ControlRequest(format!("malformed control frame: {e}")))
}

pub async fn write_to_master(stream: &mut UnixStream, frame: &ToMaster) -> Result<()> {
    let buf = bincode::serialize(frame)?;
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_frame_len(stream: &mut UnixStream) -> Result<u32> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::ControlRequest(format!("frame of {len} bytes exceeds the control protocol limit")));
    }
    Ok(len)
}
