//! src/connect.rs
//!
//! The connect dispatcher (component G): accepts newly established peer
//! connections from the connection manager and answers address lookups.
//! Framed the same way as `control` -- a length-prefixed `bincode` frame on
//! a Unix domain socket -- standing in for the original's file-descriptor
//! hand-off, which is POSIX-specific plumbing this crate can't portably
//! express; the request/reply shape and "new peer arrives asynchronously"
//! semantics are preserved.

use crate::domain::NodeId;
use crate::engine::peer::PeerFeatures;
use crate::engine::Engine;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    /// `addr` is where the orchestrator's QUIC transport should expect (or
    /// already has) a connection for this peer -- standing in for the file
    /// descriptor the original hands off directly, since a socket fd can't
    /// portably cross this boundary.
    NewPeer {
        id: NodeId,
        addr: SocketAddr,
        gossip_queries_feature: bool,
        initial_routing_sync_feature: bool,
    },
    GetAddrs {
        id: NodeId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    /// The peer session was created; the caller now owns routing its
    /// connection's wire stream to the engine under this node id.
    PeerReady,
    Failed(String),
    Addrs(Vec<SocketAddr>),
}

/// Registers a newly connected peer with the engine, returning the initial
/// messages (if any) the caller must now send on that peer's stream.
pub fn new_peer(
    engine: &mut Engine,
    id: NodeId,
    gossip_queries_feature: bool,
    initial_routing_sync_feature: bool,
) -> (Reply, Vec<crate::wire::GossipMessage>) {
    let features = PeerFeatures {
        gossip_queries: gossip_queries_feature,
        initial_routing_sync: initial_routing_sync_feature,
    };
    let initial_messages = engine.new_peer(id, features);
    (Reply::PeerReady, initial_messages)
}

pub fn get_addrs(engine: &Engine, id: NodeId) -> Reply {
    let addrs = engine
        .routing
        .get_node(&id)
        .and_then(|n| n.announcement.as_ref())
        .map(|ann| ann.addresses.clone())
        .unwrap_or_default();
    Reply::Addrs(addrs)
}

const MAX_FRAME_BYTES: u32 = 1024 * 1024;

pub async fn read_command(stream: &mut UnixStream) -> Result<Command> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::ControlRequest(format!(
            "connect frame of {len} bytes exceeds the protocol limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| Error::ControlRequest(format!("malformed connect command: {e}")))
}

pub async fn write_reply(stream: &mut UnixStream, reply: &Reply) -> Result<()> {
    let buf = bincode::serialize(reply)?;
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    Ok(())
}
