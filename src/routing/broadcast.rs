//! src/routing/broadcast.rs
//!
//! The append-only broadcast log the pacer (`engine::pacer`) walks per peer.
//! Every accepted `channel_announcement`, `channel_update`, and
//! `node_announcement` is appended exactly once; peers consume it through a
//! monotonic cursor so that "already seen" tracking is just an integer.

use crate::wire::GossipMessage;
use serde::{Deserialize, Serialize};

/// One entry in the broadcast log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub index: u64,
    pub timestamp: u32,
    pub message: GossipMessage,
}

/// Append-only, cursor-addressable log of gossip ready for re-broadcast.
#[derive(Default)]
pub struct BroadcastLog {
    entries: Vec<BroadcastEntry>,
}

impl BroadcastLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` with `timestamp`, returning its assigned index.
    pub fn push(&mut self, timestamp: u32, message: GossipMessage) -> u64 {
        let index = self.entries.len() as u64;
        self.entries.push(BroadcastEntry {
            index,
            timestamp,
            message,
        });
        index
    }

    /// The cursor a brand-new peer should start from: the current log length,
    /// i.e. "nothing yet broadcast is owed to me" (used for peers without
    /// `initial_routing_sync`).
    pub fn tip_cursor(&self) -> u64 {
        self.entries.len() as u64
    }

    /// The cursor a peer requesting a full initial routing sync should start
    /// from: the very beginning of the log.
    pub fn genesis_cursor(&self) -> u64 {
        0
    }

    /// Returns the next entry at or after `cursor` whose timestamp falls
    /// within `[ts_min, ts_max]`, and the cursor to resume from afterwards.
    /// Entries outside the window are skipped (and their index consumed),
    /// mirroring the original's "skip past messages outside the filter"
    /// behaviour rather than blocking the cursor on them forever.
    pub fn next_for_window(
        &self,
        cursor: u64,
        ts_min: u32,
        ts_max: u32,
    ) -> (Option<BroadcastEntry>, u64) {
        let start = cursor as usize;
        for (offset, entry) in self.entries.iter().enumerate().skip(start) {
            if entry.timestamp >= ts_min && entry.timestamp <= ts_max {
                return (Some(entry.clone()), offset as u64 + 1);
            }
        }
        (None, self.entries.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
