//! src/engine/pacer.rs
//!
//! The broadcast pacer: on each "wake" for a peer, emit at most one message.
//! An in-flight `query_short_channel_ids` reply always preempts the
//! broadcast log, so query responses can't be starved by a busy network.

use crate::engine::peer::PeerSession;
use crate::routing::RoutingState;
use crate::wire::GossipMessage;

/// Produces the single next message to send `peer`, or `None` if there is
/// nothing to send right now. `suppress_gossip` is the developer toggle that
/// short-circuits broadcast (but never query replies, which are a direct
/// response to something the peer asked for).
pub fn pump(peer: &mut PeerSession, routing: &RoutingState, suppress_gossip: bool) -> Option<GossipMessage> {
    if let Some(state) = peer.scid_query.as_mut() {
        let message = state.next_message(routing);
        if state.is_done() {
            peer.scid_query = None;
        }
        if message.is_some() {
            return message;
        }
    }

    if suppress_gossip || peer.window_is_empty() {
        return None;
    }

    let (entry, next_cursor) =
        routing
            .broadcast_log()
            .next_for_window(peer.broadcast_cursor, peer.ts_min, peer.ts_max);
    peer.broadcast_cursor = next_cursor;
    entry.map(|e| e.message)
}
