//! src/routing/store.rs
//!
//! Persistence for accepted gossip. The on-disk layout is explicitly not a
//! contract (see the Non-goals); this trait exists so the in-memory
//! implementation used by tests and the eventual file-backed one share one
//! interface.

use crate::domain::ShortChannelId;
use crate::wire::GossipMessage;

/// Append-only store of every gossip message this node currently believes.
/// Implementations need not preserve deleted entries; `tombstone` exists so
/// a deleted channel's id isn't immediately re-learned from a stale peer.
pub trait GossipStore: Send {
    fn append(&mut self, scid: ShortChannelId, message: GossipMessage);
    fn tombstone(&mut self, scid: ShortChannelId);
    fn is_tombstoned(&self, scid: ShortChannelId) -> bool;
}

/// Simple `Vec`-backed store sufficient for tests and for a single-process
/// node that re-syncs from peers on restart.
#[derive(Default)]
pub struct MemoryGossipStore {
    entries: Vec<(ShortChannelId, GossipMessage)>,
    tombstones: std::collections::HashSet<ShortChannelId>,
}

impl MemoryGossipStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GossipStore for MemoryGossipStore {
    fn append(&mut self, scid: ShortChannelId, message: GossipMessage) {
        self.entries.push((scid, message));
    }

    fn tombstone(&mut self, scid: ShortChannelId) {
        self.tombstones.insert(scid);
    }

    fn is_tombstoned(&self, scid: ShortChannelId) -> bool {
        self.tombstones.contains(&scid)
    }
}
