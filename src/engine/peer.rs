//! src/engine/peer.rs
//!
//! Per-peer gossip session state: feature negotiation, the broadcast cursor
//! and timestamp window, and any in-flight SCID or channel-range query.

use crate::domain::NodeId;
use crate::engine::query::{ChannelRangeQueryState, ScidQueryState};

/// Feature bits relevant to gossip, negotiated at connection time.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerFeatures {
    pub gossip_queries: bool,
    pub initial_routing_sync: bool,
}

/// Per-peer gossip session. One lives per connected peer for as long as the
/// transport stream is open; see `engine::mod::Engine` for the map that owns
/// these.
pub struct PeerSession {
    pub id: NodeId,
    pub features: PeerFeatures,

    /// Monotonic index into the routing core's broadcast log; never
    /// decreases except via an explicit reset (there is none in this
    /// protocol once set).
    pub broadcast_cursor: u64,

    /// Inclusive `[ts_min, ts_max]` gossip timestamp window. Defaults to the
    /// full range until the peer sends `gossip_timestamp_filter`.
    pub ts_min: u32,
    pub ts_max: u32,

    pub scid_query: Option<ScidQueryState>,
    pub outstanding_scid_queries: u32,
    pub channel_range_query: Option<ChannelRangeQueryState>,
    pub outstanding_pings: u32,
}

impl PeerSession {
    /// Creates a session for a newly connected peer. `initial_cursor` should
    /// be the broadcast log's tip for peers without `initial_routing_sync`,
    /// or its genesis for peers that want one (§4.B).
    pub fn new(id: NodeId, features: PeerFeatures, initial_cursor: u64) -> Self {
        Self {
            id,
            features,
            broadcast_cursor: initial_cursor,
            ts_min: 0,
            ts_max: u32::MAX,
            scid_query: None,
            outstanding_scid_queries: 0,
            channel_range_query: None,
            outstanding_pings: 0,
        }
    }

    /// Applies an inbound `gossip_timestamp_filter`, replacing the window.
    /// Resets the broadcast cursor back to genesis unconditionally, so
    /// entries before the old cursor that now fall inside the new window
    /// get replayed rather than skipped.
    pub fn set_timestamp_filter(&mut self, ts_min: u32, ts_max: u32) {
        self.ts_min = ts_min;
        self.ts_max = ts_max;
        self.broadcast_cursor = 0;
    }

    /// True if no broadcasts can currently pass the filter (the `(u32::MAX, 0)`
    /// sentinel window, or any `ts_min > ts_max`).
    pub fn window_is_empty(&self) -> bool {
        self.ts_min > self.ts_max
    }

    pub fn has_in_flight_scid_query(&self) -> bool {
        self.scid_query.is_some()
    }

    pub fn has_in_flight_range_query(&self) -> bool {
        self.channel_range_query.is_some()
    }

    /// A new session replacing an existing one for the same id: all
    /// in-flight query state for the old session is simply dropped along
    /// with the struct, matching the original's "free the old peer" eviction.
    pub fn evict_note() -> &'static str {
        "opening a new session for an existing node id evicts the prior session"
    }
}
