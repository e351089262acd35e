//! src/routing/mod.rs
//!
//! The routing core: owns the channel graph, node table, and broadcast log.
//! Its internals are out of spec scope (see the Non-goals); only the
//! operations used by the engine/control/local-channel components are a
//! contract. Route-finding is deliberately minimal (breadth-first, no fee
//! weighting) since path-finding quality is explicitly not under test.

pub mod broadcast;
pub mod store;

use crate::domain::{ChainHash, NodeId, ShortChannelId};
use crate::wire::{ChannelAnnouncement, ChannelFlags, ChannelUpdate, GossipMessage, NodeAnnouncement};
use broadcast::BroadcastLog;
use std::collections::{HashMap, HashSet};
use store::{GossipStore, MemoryGossipStore};

/// One direction's routing parameters for a channel.
#[derive(Clone, Debug)]
pub struct HalfChannel {
    pub update: ChannelUpdate,
    pub last_timestamp: u32,
    /// Set once the remote side (or our own control plane) disables this
    /// direction; distinct from `ChannelEntry::local_disabled`.
    pub enabled: bool,
}

/// A public channel as known to this node.
#[derive(Clone, Debug)]
pub struct ChannelEntry {
    pub announcement: ChannelAnnouncement,
    /// Indexed by `ChannelFlags::DIRECTION` bit (0 or 1).
    pub half_channels: [Option<HalfChannel>; 2],
    /// True once our own control plane reports the channel's peer gone or
    /// its funding output spent; deletion is deferred until the next prune
    /// sweep so in-flight queries referencing it don't crash.
    pub local_disabled: bool,
    pub capacity_sat: Option<u64>,
}

impl ChannelEntry {
    pub fn node_ids(&self) -> (NodeId, NodeId) {
        (self.announcement.node_id_1, self.announcement.node_id_2)
    }

    pub fn direction_of(&self, node_id: NodeId) -> Option<u8> {
        if self.announcement.node_id_1 == node_id {
            Some(0)
        } else if self.announcement.node_id_2 == node_id {
            Some(1)
        } else {
            None
        }
    }
}

/// A node as known to this node, kept only while it has at least one
/// channel (unannounced/unreferenced nodes are never stored, matching the
/// original's "ignore announcements for nodes without a channel" rule).
#[derive(Clone, Debug, Default)]
pub struct NodeEntry {
    pub announcement: Option<NodeAnnouncement>,
    pub channels: HashSet<ShortChannelId>,
}

/// A channel announcement accepted syntactically but awaiting confirmation
/// of its funding output via `gossip_get_txout`.
#[derive(Clone, Debug)]
pub struct PendingChannelAnnouncement {
    pub announcement: ChannelAnnouncement,
}

pub struct RoutingState {
    pub chain_hash: ChainHash,
    channels: HashMap<ShortChannelId, ChannelEntry>,
    nodes: HashMap<NodeId, NodeEntry>,
    pending: HashMap<ShortChannelId, PendingChannelAnnouncement>,
    broadcast_log: BroadcastLog,
    store: Box<dyn GossipStore>,
}

impl RoutingState {
    pub fn new(chain_hash: ChainHash) -> Self {
        Self {
            chain_hash,
            channels: HashMap::new(),
            nodes: HashMap::new(),
            pending: HashMap::new(),
            broadcast_log: BroadcastLog::new(),
            store: Box::new(MemoryGossipStore::new()),
        }
    }

    pub fn broadcast_log(&self) -> &BroadcastLog {
        &self.broadcast_log
    }

    pub fn get_channel(&self, scid: ShortChannelId) -> Option<&ChannelEntry> {
        self.channels.get(&scid)
    }

    pub fn get_channel_mut(&mut self, scid: ShortChannelId) -> Option<&mut ChannelEntry> {
        self.channels.get_mut(&scid)
    }

    pub fn get_node(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    /// Syntactic/semantic acceptance of a `channel_announcement`; the caller
    /// is still responsible for the on-chain txout confirmation round trip
    /// (`gossip_get_txout`) before the channel becomes fully routable.
    /// Returns `false` if this exact scid is already pending or known.
    pub fn handle_pending_channel_announcement(
        &mut self,
        announcement: ChannelAnnouncement,
    ) -> bool {
        let scid = announcement.short_channel_id;
        if self.store.is_tombstoned(scid) || self.channels.contains_key(&scid) {
            return false;
        }
        if announcement.chain_hash != self.chain_hash {
            return false;
        }
        self.pending
            .insert(scid, PendingChannelAnnouncement { announcement });
        true
    }

    /// Called once control confirms the funding output exists and is
    /// unspent, with its value in satoshis. Moves the pending announcement
    /// into the live graph and appends it to the broadcast log.
    pub fn confirm_channel_announcement(
        &mut self,
        scid: ShortChannelId,
        capacity_sat: u64,
        timestamp: u32,
    ) -> bool {
        let Some(pending) = self.pending.remove(&scid) else {
            return false;
        };
        let (n1, n2) = (
            pending.announcement.node_id_1,
            pending.announcement.node_id_2,
        );
        self.nodes.entry(n1).or_default().channels.insert(scid);
        self.nodes.entry(n2).or_default().channels.insert(scid);

        self.store
            .append(scid, GossipMessage::ChannelAnnouncement(pending.announcement.clone()));
        self.broadcast_log
            .push(timestamp, GossipMessage::ChannelAnnouncement(pending.announcement.clone()));

        self.channels.insert(
            scid,
            ChannelEntry {
                announcement: pending.announcement,
                half_channels: [None, None],
                local_disabled: false,
                capacity_sat: Some(capacity_sat),
            },
        );
        true
    }

    pub fn is_pending(&self, scid: ShortChannelId) -> bool {
        self.pending.contains_key(&scid)
    }

    /// Applies a `channel_update`, rejecting it if the channel is unknown or
    /// the update isn't newer than what we already have. Returns whether it
    /// was new (and so should be rebroadcast).
    pub fn apply_channel_update(&mut self, update: ChannelUpdate) -> bool {
        let scid = update.short_channel_id;
        let direction = update.channel_flags.direction_bit() as usize;
        let Some(channel) = self.channels.get_mut(&scid) else {
            return false;
        };
        if update.chain_hash != self.chain_hash {
            return false;
        }
        if let Some(existing) = &channel.half_channels[direction] {
            if update.timestamp <= existing.last_timestamp {
                return false;
            }
        }
        let enabled = !update.channel_flags.is_disabled();
        let timestamp = update.timestamp;
        channel.half_channels[direction] = Some(HalfChannel {
            update: update.clone(),
            last_timestamp: timestamp,
            enabled,
        });
        self.store
            .append(scid, GossipMessage::ChannelUpdate(update.clone()));
        self.broadcast_log
            .push(timestamp, GossipMessage::ChannelUpdate(update));
        true
    }

    /// Returns `true` if `announcement` carries no new information versus
    /// what we already store for this node (used to suppress redundant
    /// rebroadcasts of our own node announcement).
    pub fn node_announcement_redundant(&self, announcement: &NodeAnnouncement) -> bool {
        match self.nodes.get(&announcement.node_id).and_then(|n| n.announcement.as_ref()) {
            Some(existing) => {
                existing.features == announcement.features
                    && existing.rgb_color == announcement.rgb_color
                    && existing.alias == announcement.alias
                    && existing.addresses == announcement.addresses
            }
            None => false,
        }
    }

    /// Applies a `node_announcement`. Ignored (returns `false`) if we don't
    /// know of any channel for this node, or the timestamp isn't newer.
    pub fn apply_node_announcement(&mut self, announcement: NodeAnnouncement) -> bool {
        let node_id = announcement.node_id;
        let Some(entry) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        if entry.channels.is_empty() {
            return false;
        }
        if let Some(existing) = &entry.announcement {
            if announcement.timestamp <= existing.timestamp {
                return false;
            }
        }
        let timestamp = announcement.timestamp;
        entry.announcement = Some(announcement.clone());
        self.broadcast_log
            .push(timestamp, GossipMessage::NodeAnnouncement(announcement));
        true
    }

    /// All short channel ids whose announced block falls in
    /// `[first_blocknum, first_blocknum + number_of_blocks)`, sorted
    /// ascending. Callers must check `first_blocknum + number_of_blocks`
    /// doesn't overflow `u32` before calling.
    pub fn scids_in_block_range(&self, first_blocknum: u32, number_of_blocks: u32) -> Vec<ShortChannelId> {
        let end = first_blocknum.saturating_add(number_of_blocks);
        let mut scids: Vec<_> = self
            .channels
            .keys()
            .filter(|scid| scid.block() >= first_blocknum && scid.block() < end)
            .copied()
            .collect();
        scids.sort();
        scids
    }

    /// Sorts and deduplicates a list of node ids, as required before sending
    /// the `node_announcement`s in a SCID-query reply.
    pub fn uniquify_node_ids(ids: &mut Vec<NodeId>) {
        ids.sort();
        ids.dedup();
    }

    pub fn mark_channel_unroutable(&mut self, scid: ShortChannelId, direction: u8) {
        if let Some(channel) = self.channels.get_mut(&scid) {
            if let Some(half) = channel.half_channels.get_mut(direction as usize).and_then(|h| h.as_mut()) {
                half.enabled = false;
            }
        }
    }

    pub fn get_channel_peer(&self, scid: ShortChannelId, self_id: NodeId) -> Option<NodeId> {
        let channel = self.channels.get(&scid)?;
        let (n1, n2) = channel.node_ids();
        if n1 == self_id {
            Some(n2)
        } else if n2 == self_id {
            Some(n1)
        } else {
            None
        }
    }

    /// The `outpoint_spent` path: the funding output was spent on-chain, so
    /// the channel is deleted immediately and tombstoned so a stale peer
    /// can't re-teach it to us.
    pub fn outpoint_spent(&mut self, scid: ShortChannelId) -> bool {
        let removed = self.channels.remove(&scid);
        if let Some(channel) = removed {
            let (n1, n2) = channel.node_ids();
            self.prune_node_if_orphaned(n1, scid);
            self.prune_node_if_orphaned(n2, scid);
            self.store.tombstone(scid);
            true
        } else {
            self.pending.remove(&scid).is_some()
        }
    }

    /// The `local_channel_close` path: one of our own channels just closed.
    /// Unlike `outpoint_spent`, deletion is deferred to the next prune
    /// sweep; we only flag it disabled so in-flight queries still see it.
    pub fn local_channel_close(&mut self, scid: ShortChannelId) -> bool {
        if let Some(channel) = self.channels.get_mut(&scid) {
            channel.local_disabled = true;
            true
        } else {
            false
        }
    }

    fn prune_node_if_orphaned(&mut self, node_id: NodeId, scid: ShortChannelId) {
        if let Some(entry) = self.nodes.get_mut(&node_id) {
            entry.channels.remove(&scid);
            if entry.channels.is_empty() {
                self.nodes.remove(&node_id);
            }
        }
    }

    /// Removes channels whose half-channels have both gone stale (no
    /// update within `prune_timeout_secs`) and channels flagged
    /// `local_disabled`. Returns the pruned scids so the caller can tell
    /// control which channels disappeared.
    pub fn route_prune(&mut self, now: u32, prune_timeout_secs: u32) -> Vec<ShortChannelId> {
        let mut pruned = Vec::new();
        let stale: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, c)| {
                if c.local_disabled {
                    return true;
                }
                c.half_channels
                    .iter()
                    .flatten()
                    .all(|h| now.saturating_sub(h.last_timestamp) > prune_timeout_secs)
            })
            .map(|(scid, _)| *scid)
            .collect();

        for scid in stale {
            if let Some(channel) = self.channels.remove(&scid) {
                let (n1, n2) = channel.node_ids();
                self.prune_node_if_orphaned(n1, scid);
                self.prune_node_if_orphaned(n2, scid);
                pruned.push(scid);
            }
        }
        pruned
    }

    /// Channels where we are one endpoint, for control's "incoming
    /// channels" enumeration.
    pub fn local_channels(&self, self_id: NodeId) -> Vec<ShortChannelId> {
        self.channels
            .iter()
            .filter(|(_, c)| {
                let (n1, n2) = c.node_ids();
                n1 == self_id || n2 == self_id
            })
            .map(|(scid, _)| *scid)
            .collect()
    }

    /// Minimal unweighted breadth-first route, since path quality is
    /// explicitly out of scope; returns the sequence of hops from `src` to
    /// `dst`, inclusive of neither endpoint's channel ids beyond what's
    /// actually traversed.
    pub fn find_route(&self, src: NodeId, dst: NodeId) -> Option<Vec<ShortChannelId>> {
        use std::collections::VecDeque;
        if src == dst {
            return Some(Vec::new());
        }
        let mut visited = HashSet::new();
        visited.insert(src);
        let mut queue = VecDeque::new();
        queue.push_back((src, Vec::new()));

        while let Some((node, path)) = queue.pop_front() {
            let Some(entry) = self.nodes.get(&node) else { continue };
            for &scid in &entry.channels {
                let Some(channel) = self.channels.get(&scid) else { continue };
                if channel.local_disabled {
                    continue;
                }
                let (n1, n2) = channel.node_ids();
                let next = if n1 == node { n2 } else { n1 };
                if visited.contains(&next) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(scid);
                if next == dst {
                    return Some(next_path);
                }
                visited.insert(next);
                queue.push_back((next, next_path));
            }
        }
        None
    }
}
