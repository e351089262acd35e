//! src/config.rs
//!
//! Strongly-typed `Config` for all runtime parameters, loaded from a TOML
//! file overlaid with `GOSSIPD_`-prefixed environment variables via
//! `figment`. Mirrors the fields carried by the `WIRE_GOSSIPCTL_INIT`
//! control message plus the two developer-only toggles.

use crate::domain::ChainHash;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level runtime configuration for the gossip daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Path to this node's persisted ed25519 identity key.
    pub identity_path: PathBuf,

    /// Chain this gossip graph describes; messages for any other chain are
    /// silently ignored.
    pub chain_hash: ChainHash,

    /// Up to 32 bytes of human-readable node alias, used in our own
    /// `node_announcement`.
    pub alias: [u8; 32],

    /// RGB colour to display for this node.
    pub rgb: [u8; 3],

    /// Raw feature bits advertised in our own `node_announcement`.
    pub global_features: Vec<u8>,

    /// Addresses to advertise for this node; empty means "don't announce".
    pub announcable_addresses: Vec<SocketAddr>,

    /// Socket address the peer-facing QUIC transport listens on.
    pub p2p_addr: SocketAddr,

    /// Unix domain socket path for the control-plane IPC.
    pub control_socket_path: PathBuf,

    /// Unix domain socket path for the connect-plane IPC.
    pub connect_socket_path: PathBuf,

    /// How often a local channel's `channel_update` is refreshed absent any
    /// other trigger. `prune_timeout` is always `2 * update_channel_interval`,
    /// and the keep-alive sweep runs every `prune_timeout / 4`.
    pub update_channel_interval_secs: u32,

    /// Developer-only knobs; inert unless the `developer` feature is enabled.
    #[serde(default)]
    pub developer: DeveloperConfig,
}

/// Developer-only configuration, gated behind the `developer` Cargo feature
/// (mirrors the original daemon's `#if DEVELOPER` compilation gate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeveloperConfig {
    /// Caps the encoded size of an outbound SCID list for testing the
    /// splitting logic with small buffers; `None` uses the real wire limit.
    pub max_scids_encode_size: Option<usize>,

    /// Suppresses all broadcast pacing when true, so tests can assert on
    /// exact inbound/outbound message sequences.
    pub suppress_gossip: bool,
}

impl Config {
    pub fn prune_timeout_secs(&self) -> u32 {
        self.update_channel_interval_secs.saturating_mul(2)
    }

    pub fn keepalive_sweep_secs(&self) -> u32 {
        (self.prune_timeout_secs() / 4).max(1)
    }

    /// Loads configuration from `gossipd.toml` and environment variables,
    /// using `Default` as the base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("gossipd.toml"))
            .merge(Env::prefixed("GOSSIPD_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("identity.key"),
            chain_hash: ChainHash::from_bytes([0u8; 32]),
            alias: [0u8; 32],
            rgb: [0u8; 3],
            global_features: Vec::new(),
            announcable_addresses: Vec::new(),
            p2p_addr: "127.0.0.1:9735".parse().unwrap(),
            control_socket_path: PathBuf::from("gossipd-control.sock"),
            connect_socket_path: PathBuf::from("gossipd-connect.sock"),
            update_channel_interval_secs: 3600,
            developer: DeveloperConfig::default(),
        }
    }
}
