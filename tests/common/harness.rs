//! tests/common/harness.rs
//!
//! Building blocks for black-box tests of the gossip daemon: a `TestNode`
//! that spawns a real `App` behind its control/connect Unix sockets, and a
//! `RawPeer` that speaks the QUIC wire protocol directly, standing in for a
//! peer the orchestrator never spawned itself.

use anyhow::{Context, Result};
use channel_gossip::app::ExitOutcome;
use channel_gossip::connect;
use channel_gossip::control::{self, Command, FromMaster, Reply, ToMaster};
use channel_gossip::domain::{Identity, NodeId};
use channel_gossip::wire::GossipMessage;
use channel_gossip::{App, Config};
use quinn::Endpoint;
use rcgen::{Certificate, CertificateParams, DistinguishedName};
use serde::{de::DeserializeOwned, Serialize};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

/// Every node in a test process shares one self-signed CA/leaf pair: QUIC
/// SNI is hardcoded to `"localhost"` regardless of a node's own bind
/// address, and `configure_tls` always reads `certs/...` relative to the
/// process's current directory, so one `chdir`, done once, suffices for the
/// whole test binary.
fn ensure_shared_certs() {
    static CERTS: OnceLock<TempDir> = OnceLock::new();
    CERTS.get_or_init(|| {
        let dir = tempdir().expect("tempdir for shared test certs");
        write_certs(dir.path());
        std::env::set_current_dir(dir.path()).expect("chdir into shared test certs dir");
        dir
    });
}

fn write_certs(root: &Path) {
    let certs_dir = root.join("certs");
    std::fs::create_dir_all(&certs_dir).unwrap();

    let ca_params = CertificateParams::new(vec!["localhost".to_string()]);
    let ca_cert = Certificate::from_params(ca_params).unwrap();

    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]);
    leaf_params.distinguished_name = DistinguishedName::new();
    let leaf_cert = Certificate::from_params(leaf_params).unwrap();
    let leaf_der = leaf_cert.serialize_der_with_signer(&ca_cert).unwrap();

    std::fs::write(certs_dir.join("ca.cert"), ca_cert.serialize_der().unwrap()).unwrap();
    std::fs::write(certs_dir.join("node.cert"), leaf_der).unwrap();
    std::fs::write(certs_dir.join("node.key"), leaf_cert.serialize_private_key_der()).unwrap();
}

/// Grabs a free port by binding a throwaway TCP listener, then handing the
/// same address to whatever UDP/Unix service actually wants it.
pub fn ephemeral_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let buf = bincode::serialize(value)?;
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

async fn connect_with_retry(path: &Path) -> Result<UnixStream> {
    for _ in 0..200 {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    anyhow::bail!("timed out waiting for {} to come up", path.display())
}

/// A running gossip daemon plus the control/connect connections a real
/// `lightningd`/`connectd` pair would hold open to it.
pub struct TestNode {
    pub node_id: NodeId,
    pub p2p_addr: SocketAddr,
    control: UnixStream,
    connect: UnixStream,
    handle: JoinHandle<std::result::Result<ExitOutcome, channel_gossip::Error>>,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Spawns a node with a fresh identity and sensible test-sized defaults;
    /// `configure` may override any `Config` field before it starts.
    pub async fn spawn(configure: impl FnOnce(&mut Config)) -> Result<Self> {
        ensure_shared_certs();

        let temp_dir = tempdir().context("per-node temp dir")?;
        let identity_path = temp_dir.path().join("identity.key");
        let node_id = Identity::from_file(&identity_path)?.node_id;

        let mut config = Config {
            identity_path,
            p2p_addr: ephemeral_addr(),
            control_socket_path: temp_dir.path().join("control.sock"),
            connect_socket_path: temp_dir.path().join("connect.sock"),
            update_channel_interval_secs: 20,
            ..Config::default()
        };
        configure(&mut config);

        let p2p_addr = config.p2p_addr;
        let control_path = config.control_socket_path.clone();
        let connect_path = config.connect_socket_path.clone();

        let handle = tokio::spawn(async move { App::new(config)?.run().await });

        // `App::run` binds and accepts the control socket first, then the
        // connect socket, both as a single blocking `accept()` -- dial in
        // that exact order.
        let control = connect_with_retry(&control_path).await?;
        let connect = connect_with_retry(&connect_path).await?;

        Ok(Self {
            node_id,
            p2p_addr,
            control,
            connect,
            handle,
            _temp_dir: temp_dir,
        })
    }

    /// Sends a control command, transparently answering any interleaved
    /// `GetTxout` request along the way (the harness plays chain oracle:
    /// every pending channel is "funded" at `funding_sats`).
    pub async fn command(&mut self, command: Command) -> Result<Reply> {
        self.command_with_funding(command, 1_000_000).await
    }

    pub async fn command_with_funding(&mut self, command: Command, funding_sats: u64) -> Result<Reply> {
        write_frame(&mut self.control, &FromMaster::Command(command)).await?;
        loop {
            match read_frame::<ToMaster>(&mut self.control).await? {
                ToMaster::Reply(reply) => return Ok(reply),
                ToMaster::GetTxout { scid } => {
                    write_frame(
                        &mut self.control,
                        &FromMaster::TxoutReply { scid, satoshis: Some(funding_sats) },
                    )
                    .await?;
                }
            }
        }
    }

    /// Like `command`, but answers a pending `GetTxout` with "output not
    /// found", exercising the spent/missing-funding path.
    pub async fn command_with_missing_funding(&mut self, command: Command) -> Result<Reply> {
        write_frame(&mut self.control, &FromMaster::Command(command)).await?;
        loop {
            match read_frame::<ToMaster>(&mut self.control).await? {
                ToMaster::Reply(reply) => return Ok(reply),
                ToMaster::GetTxout { scid } => {
                    write_frame(&mut self.control, &FromMaster::TxoutReply { scid, satoshis: None }).await?;
                }
            }
        }
    }

    pub async fn register_peer(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        gossip_queries_feature: bool,
        initial_routing_sync_feature: bool,
    ) -> Result<connect::Reply> {
        write_frame(
            &mut self.connect,
            &connect::Command::NewPeer { id, addr, gossip_queries_feature, initial_routing_sync_feature },
        )
        .await?;
        read_frame(&mut self.connect).await
    }

    /// Registers `other` as a peer of `self`, mirroring what `connectd`
    /// would do once the two endpoints' QUIC connection is established --
    /// both sides see the other at its configured listen address, since the
    /// transport reuses one bound socket for dialing and accepting alike.
    pub async fn befriend(&mut self, other: &TestNode) -> Result<()> {
        self.register_peer(other.node_id, other.p2p_addr, false, false).await?;
        Ok(())
    }

    /// Closes the control connection, the same signal a crashed or exiting
    /// main process would send, and waits for the node to shut down.
    pub async fn shutdown_and_wait_exit(mut self) -> Result<ExitOutcome> {
        drop(self.control);
        drop(self.connect);
        let outcome = self.handle.await.context("app task panicked")??;
        Ok(outcome)
    }
}

/// Polls `f` until it returns `Some`, or gives up after `timeout`.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for condition");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A bare QUIC peer that dials a node's `p2p_addr` directly, bypassing the
/// orchestrator entirely -- stands in for a channel counterparty or a
/// misbehaving peer the test wants full control over.
pub struct RawPeer {
    endpoint: Endpoint,
    connection: quinn::Connection,
}

impl RawPeer {
    /// Dials `to` from a fixed `bind_addr`, so the caller can register that
    /// exact address with the target node's connect socket beforehand --
    /// the orchestrator only processes inbound messages from addresses it
    /// already knows about.
    pub async fn connect(to: SocketAddr, bind_addr: SocketAddr) -> Result<Self> {
        ensure_shared_certs();

        let ca_der = std::fs::read("certs/ca.cert")?;
        let ca_cert = rustls::p_k_i_types::CertificateDer::from(ca_der);
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(ca_cert)?;
        let mut client_config = quinn::ClientConfig::with_root_certificates(root_store)?;
        client_config.alpn_protocols = vec![b"gossip/1.0".to_vec()];

        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint.connect(to, "localhost")?.await?;
        Ok(Self { endpoint, connection })
    }

    pub async fn send(&self, message: &GossipMessage) -> Result<()> {
        let bytes = bincode::serialize(message)?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut send = self.connection.open_uni().await?;
        send.write_all(bytes).await?;
        send.finish().await?;
        Ok(())
    }

    pub async fn recv_one(&self, timeout: Duration) -> Result<GossipMessage> {
        let fut = async {
            let mut recv = self.connection.accept_uni().await?;
            let bytes = recv.read_to_end(1024 * 1024).await?;
            Ok::<_, anyhow::Error>(bincode::deserialize(&bytes)?)
        };
        tokio::time::timeout(timeout, fut).await.context("timed out waiting for a reply")?
    }

    pub async fn close(self) {
        self.connection.close(0u32.into(), b"test done");
        self.endpoint.wait_idle().await;
    }
}
