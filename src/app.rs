//! src/app.rs
//!
//! The orchestrator (component H): a single-threaded event loop wiring the
//! control socket, the connect socket, the QUIC transport, and the engine's
//! per-peer pacers together. A single spawned service per concern, each
//! holding its own channel endpoints, but every mutable piece of shared
//! state is the `Engine` behind one
//! `tokio::sync::Mutex`, not a set of independent actors talking over mpsc --
//! the engine's internal invariants (one in-flight query per peer, monotonic
//! timestamps) depend on being touched from a single logical place at a time.

use crate::{
    config::Config,
    connect,
    control::{self, FromMaster, PendingPings, ToMaster},
    domain::{Identity, NodeId, ShortChannelId},
    engine::{local_channel, Engine, EngineEffect},
    error::Result,
    signer::{LocalSigner, Signer},
    transport::{ConnectionEvent, InboundMessage, Transport, TransportCommand},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// How often a peer's pacer is woken to emit at most one message. Not named
/// by the distilled spec; chosen to keep query replies and broadcast
/// dissemination responsive without busy-waiting the peer's task.
const PUMP_INTERVAL: Duration = Duration::from_millis(200);

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as u32
}

/// How the run loop terminated, so `main` can translate it into the right
/// process exit code (§7: control stream closure is exit code 2, everything
/// else a normal `Ok(())`/logged fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Normal,
    ControlGone,
}

/// The address <-> node id correspondence the connect dispatcher teaches us,
/// standing in for the original's direct file-descriptor hand-off.
#[derive(Default)]
struct PeerAddrs {
    by_id: HashMap<NodeId, SocketAddr>,
    by_addr: HashMap<SocketAddr, NodeId>,
}

impl PeerAddrs {
    fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        self.by_id.insert(id, addr);
        self.by_addr.insert(addr, id);
    }

    fn remove_by_id(&mut self, id: &NodeId) {
        if let Some(addr) = self.by_id.remove(id) {
            self.by_addr.remove(&addr);
        }
    }
}

/// Encapsulates the entire application: configuration plus the lifecycle
/// management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub async fn run(self) -> Result<ExitOutcome> {
        let identity = Identity::from_file(&self.config.identity_path)?;
        let self_id = identity.node_id;
        tracing::info!(node_id = %self_id, p2p_addr = %self.config.p2p_addr, "starting gossip daemon");

        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(identity));
        let engine = Arc::new(Mutex::new(Engine::new(self_id, self.config.clone(), signer)));

        // No peers are connected yet: every local channel starts disabled
        // (§4.E "on init").
        {
            let mut e = engine.lock().await;
            for scid in e.routing.local_channels(self_id) {
                e.routing.local_channel_close(scid);
            }
        }

        let (transport_command_tx, transport_command_rx) = mpsc::channel::<TransportCommand>(256);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(256);
        let (conn_event_tx, mut conn_event_rx) = mpsc::channel::<ConnectionEvent>(256);

        let transport = Transport::new(
            self.config.p2p_addr,
            Vec::new(),
            transport_command_rx,
            inbound_tx,
            conn_event_tx,
        )?;
        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));

        let peers = Arc::new(Mutex::new(PeerAddrs::default()));
        let pump_tokens: Arc<Mutex<HashMap<NodeId, CancellationToken>>> = Arc::new(Mutex::new(HashMap::new()));
        let pending_pings = Arc::new(Mutex::new(PendingPings::default()));
        let pending_txouts: Arc<Mutex<HashMap<ShortChannelId, oneshot::Sender<Option<u64>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let _ = std::fs::remove_file(&self.config.control_socket_path);
        let control_listener = UnixListener::bind(&self.config.control_socket_path)?;
        tracing::info!(path = ?self.config.control_socket_path, "waiting for control connection");
        let (control_stream, _) = control_listener.accept().await?;
        let (mut control_read, control_write) = control_stream.into_split();
        let control_write = Arc::new(Mutex::new(control_write));

        let _ = std::fs::remove_file(&self.config.connect_socket_path);
        let connect_listener = UnixListener::bind(&self.config.connect_socket_path)?;
        tracing::info!(path = ?self.config.connect_socket_path, "waiting for connect connection");
        let (mut connect_stream, _) = connect_listener.accept().await?;

        // --- Inbound wire message pump: the peer-facing dispatch table. ---
        let inbound_task = {
            let engine = engine.clone();
            let peers = peers.clone();
            let pending_pings = pending_pings.clone();
            let pending_txouts = pending_txouts.clone();
            let pump_tokens = pump_tokens.clone();
            let transport_command_tx = transport_command_tx.clone();
            let control_write = control_write.clone();
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        maybe = inbound_rx.recv() => {
                            let Some(InboundMessage { peer_addr, message }) = maybe else { break };
                            let id = peers.lock().await.by_addr.get(&peer_addr).copied();
                            let Some(id) = id else {
                                tracing::warn!(%peer_addr, "inbound message from an address with no registered peer, dropping");
                                continue;
                            };
                            let _span = tracing::info_span!("peer", id = %id).entered();
                            let result = engine.lock().await.handle_wire_message(id, message);
                            match result {
                                Ok(effects) => {
                                    for effect in effects {
                                        match effect {
                                            EngineEffect::Reply(msg) => {
                                                let _ = transport_command_tx
                                                    .send(TransportCommand::SendMessage(peer_addr, msg))
                                                    .await;
                                            }
                                            EngineEffect::RequestTxout(scid) => {
                                                let (tx, rx) = oneshot::channel();
                                                pending_txouts.lock().await.insert(scid, tx);
                                                let mut w = control_write.lock().await;
                                                if control::write_to_master(&mut w, &ToMaster::GetTxout { scid }).await.is_err() {
                                                    tracing::error!("failed to request txout confirmation from control socket");
                                                }
                                                drop(w);
                                                let engine = engine.clone();
                                                tokio::spawn(async move {
                                                    if let Ok(satoshis) = rx.await {
                                                        let now = now_unix();
                                                        let mut e = engine.lock().await;
                                                        match satoshis {
                                                            Some(sats) => {
                                                                e.routing.confirm_channel_announcement(scid, sats, now);
                                                            }
                                                            None => {
                                                                e.routing.outpoint_spent(scid);
                                                            }
                                                        }
                                                    }
                                                });
                                            }
                                            EngineEffect::PongReceived { padding_len } => {
                                                pending_pings.lock().await.fulfil(id, padding_len);
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    use crate::error::Severity::*;
                                    match e.severity() {
                                        MalformedMessage | InvalidContent => {
                                            tracing::warn!(error = %e, "dropping invalid message");
                                        }
                                        ProtocolViolation => {
                                            tracing::warn!(error = %e, "closing peer session for a protocol violation");
                                            let error_msg = crate::wire::GossipMessage::Error(
                                                crate::wire::ErrorMessage { data: e.to_string().into_bytes() },
                                            );
                                            let _ = transport_command_tx
                                                .send(TransportCommand::SendMessage(peer_addr, error_msg))
                                                .await;
                                            let _ = transport_command_tx.send(TransportCommand::ClosePeer(peer_addr)).await;

                                            let mut engine_guard = engine.lock().await;
                                            engine_guard.remove_peer(&id);
                                            for scid in engine_guard.routing.local_channels(engine_guard.self_id) {
                                                if engine_guard.routing.get_channel_peer(scid, engine_guard.self_id) == Some(id) {
                                                    engine_guard.routing.local_channel_close(scid);
                                                }
                                            }
                                            drop(engine_guard);
                                            peers.lock().await.remove_by_id(&id);
                                            if let Some(token) = pump_tokens.lock().await.remove(&id) {
                                                token.cancel();
                                            }
                                        }
                                        _ => {
                                            tracing::error!(error = %e, "internal error handling a wire message");
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            })
        };

        // --- Connection-event pump: peer destruction bookkeeping (§4.E). ---
        let conn_event_task = {
            let engine = engine.clone();
            let peers = peers.clone();
            let pump_tokens = pump_tokens.clone();
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        maybe = conn_event_rx.recv() => {
                            let Some(event) = maybe else { break };
                            match event {
                                ConnectionEvent::PeerConnected { peer_addr } => {
                                    tracing::debug!(%peer_addr, "transport connection established");
                                }
                                ConnectionEvent::PeerDisconnected { peer_addr } => {
                                    let id = peers.lock().await.by_addr.get(&peer_addr).copied();
                                    let Some(id) = id else { continue };
                                    tracing::info!(%id, %peer_addr, "peer disconnected");
                                    let mut e = engine.lock().await;
                                    e.remove_peer(&id);
                                    for scid in e.routing.local_channels(e.self_id) {
                                        if e.routing.get_channel_peer(scid, e.self_id) == Some(id) {
                                            e.routing.local_channel_close(scid);
                                        }
                                    }
                                    drop(e);
                                    peers.lock().await.remove_by_id(&id);
                                    if let Some(token) = pump_tokens.lock().await.remove(&id) {
                                        token.cancel();
                                    }
                                }
                            }
                        }
                    }
                }
            })
        };

        // --- Connect dispatcher: registers new peers, starts their pacer. ---
        let connect_task = {
            let engine = engine.clone();
            let peers = peers.clone();
            let pump_tokens = pump_tokens.clone();
            let transport_command_tx = transport_command_tx.clone();
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        command = connect::read_command(&mut connect_stream) => {
                            let command = match command {
                                Ok(c) => c,
                                Err(e) => {
                                    tracing::warn!(error = %e, "connect socket closed or malformed, stopping connect dispatcher");
                                    break;
                                }
                            };
                            let reply = match command {
                                connect::Command::NewPeer { id, addr, gossip_queries_feature, initial_routing_sync_feature } => {
                                    let (reply, initial_messages) = {
                                        let mut e = engine.lock().await;
                                        connect::new_peer(&mut e, id, gossip_queries_feature, initial_routing_sync_feature)
                                    };
                                    peers.lock().await.insert(id, addr);
                                    for msg in initial_messages {
                                        let _ = transport_command_tx.send(TransportCommand::SendMessage(addr, msg)).await;
                                    }
                                    let token = shutdown.child_token();
                                    pump_tokens.lock().await.insert(id, token.clone());
                                    spawn_pump_task(token, engine.clone(), transport_command_tx.clone(), id, addr);
                                    reply
                                }
                                connect::Command::GetAddrs { id } => {
                                    let e = engine.lock().await;
                                    connect::get_addrs(&e, id)
                                }
                            };
                            if connect::write_reply(&mut connect_stream, &reply).await.is_err() {
                                tracing::warn!("failed to write connect reply, stopping connect dispatcher");
                                break;
                            }
                        }
                    }
                }
            })
        };

        // --- Control dispatcher: the main process's command stream. ---
        let control_gone = Arc::new(Mutex::new(false));
        let control_task = {
            let engine = engine.clone();
            let peers = peers.clone();
            let pending_pings = pending_pings.clone();
            let pending_txouts = pending_txouts.clone();
            let control_write = control_write.clone();
            let transport_command_tx = transport_command_tx.clone();
            let shutdown = self.shutdown_token.clone();
            let control_gone = control_gone.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = control::read_from_master(&mut control_read) => {
                            match frame {
                                Ok(FromMaster::Command(command)) => {
                                    let (tx, rx) = oneshot::channel();
                                    let mut outbound = Vec::new();
                                    {
                                        let mut e = engine.lock().await;
                                        let mut pending = pending_pings.lock().await;
                                        control::dispatch(&mut e, command, &mut pending, tx, now_unix(), &mut outbound).await;
                                    }
                                    for (peer_id, msg) in outbound {
                                        let addr = peers.lock().await.by_id.get(&peer_id).copied();
                                        if let Some(addr) = addr {
                                            let _ = transport_command_tx.send(TransportCommand::SendMessage(addr, msg)).await;
                                        }
                                    }
                                    let control_write = control_write.clone();
                                    tokio::spawn(async move {
                                        if let Ok(reply) = rx.await {
                                            let mut w = control_write.lock().await;
                                            let _ = control::write_to_master(&mut w, &ToMaster::Reply(reply)).await;
                                        }
                                    });
                                }
                                Ok(FromMaster::TxoutReply { scid, satoshis }) => {
                                    if let Some(tx) = pending_txouts.lock().await.remove(&scid) {
                                        let _ = tx.send(satoshis);
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "control connection gone, shutting down");
                                    *control_gone.lock().await = true;
                                    shutdown.cancel();
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        // --- Global network-refresh timer: keep-alives and route pruning. ---
        let refresh_task = {
            let engine = engine.clone();
            let transport_command_tx = transport_command_tx.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(config.keepalive_sweep_secs() as u64));
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            refresh_network(&engine, &transport_command_tx, &config).await;
                        }
                    }
                }
            })
        };

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                shutdown_token.cancel();
            }
        });

        self.shutdown_token.cancelled().await;

        for task in [transport_task, inbound_task, conn_event_task, connect_task, control_task, refresh_task] {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "a service task panicked");
            }
        }

        if *control_gone.lock().await {
            Ok(ExitOutcome::ControlGone)
        } else {
            Ok(ExitOutcome::Normal)
        }
    }
}

fn spawn_pump_task(
    token: CancellationToken,
    engine: Arc<Mutex<Engine>>,
    transport_command_tx: mpsc::Sender<TransportCommand>,
    id: NodeId,
    addr: SocketAddr,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PUMP_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let msg = engine.lock().await.pump_peer(&id);
                    if let Some(msg) = msg {
                        let _ = transport_command_tx.send(TransportCommand::SendMessage(addr, msg)).await;
                    }
                }
            }
        }
    });
}

/// §4.E's keep-alive sweep plus route pruning, run every `prune_timeout / 4`.
async fn refresh_network(
    engine: &Arc<Mutex<Engine>>,
    transport_command_tx: &mpsc::Sender<TransportCommand>,
    config: &Config,
) {
    let now = now_unix();
    let mut e = engine.lock().await;
    let self_id = e.self_id;
    let chain_hash = e.chain_hash();
    let signer = e.signer().clone();

    let due = local_channel::keepalive_candidates(&e.routing, self_id, now, config.update_channel_interval_secs);
    let mut refreshed_any = false;
    for (scid, direction) in due {
        let Some(channel) = e.routing.get_channel(scid) else { continue };
        let Some(half) = &channel.half_channels[direction as usize] else {
            tracing::debug!(?scid, direction, "skipping keep-alive: no prior channel_update to refresh");
            continue;
        };
        let params = local_channel::ChannelParams {
            cltv_expiry_delta: half.update.cltv_expiry_delta,
            htlc_minimum_msat: half.update.htlc_minimum_msat,
            fee_base_msat: half.update.fee_base_msat,
            fee_proportional_millionths: half.update.fee_proportional_millionths,
            htlc_maximum_msat: half.update.htlc_maximum_msat,
        };
        let last_timestamp = Some(half.last_timestamp);
        match local_channel::build_channel_update(signer.as_ref(), chain_hash, scid, direction, now, last_timestamp, params, false).await {
            Ok(update) => {
                e.routing.apply_channel_update(update);
                refreshed_any = true;
            }
            Err(err) => tracing::error!(?scid, error = %err, "signer failed to refresh keep-alive channel_update"),
        }
    }

    if refreshed_any {
        maybe_announce_self(&mut e, now).await;
    }

    let pruned = e.routing.route_prune(now, config.prune_timeout_secs());
    if !pruned.is_empty() {
        tracing::info!(count = pruned.len(), "pruned stale channels");
    }
    let _ = transport_command_tx; // pacers pick up the rebroadcast via the broadcast log
}

/// §4.E: rebuild and publish our own `node_announcement`, unless it would be
/// redundant or we have no announced channel yet to hang it off of.
async fn maybe_announce_self(engine: &mut Engine, now: u32) {
    let self_id = engine.self_id;
    if engine.routing.local_channels(self_id).is_empty() {
        return;
    }
    let config = engine.config().clone();
    let last_timestamp = engine
        .routing
        .get_node(&self_id)
        .and_then(|n| n.announcement.as_ref())
        .map(|a| a.timestamp);

    let candidate = crate::wire::NodeAnnouncement {
        signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
        features: config.global_features.clone(),
        timestamp: last_timestamp.map(|t| t.max(now)).unwrap_or(now),
        node_id: self_id,
        rgb_color: config.rgb,
        alias: config.alias,
        addresses: config.announcable_addresses.clone(),
    };
    if last_timestamp.is_some() && engine.routing.node_announcement_redundant(&candidate) {
        return;
    }

    let signer = engine.signer().clone();
    match local_channel::build_node_announcement(
        signer.as_ref(),
        self_id,
        now,
        last_timestamp,
        config.global_features,
        config.rgb,
        config.alias,
        config.announcable_addresses,
    )
    .await
    {
        Ok(announcement) => {
            engine.routing.apply_node_announcement(announcement);
        }
        Err(err) => tracing::error!(error = %err, "signer failed to produce our node_announcement"),
    }
}
