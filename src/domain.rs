//! src/domain.rs
//!
//! Core identifiers and cryptographic identity for the gossip graph: node ids,
//! short channel ids, chain hashes, and the node's own signing identity.

use crate::error::{Error, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, fs, io, path::Path};

/// A node's public identity on the gossip network.
#[derive(Clone, Copy, Eq, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(&self.0)?)
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Node ids order lexicographically by public-key bytes; `handle_query_short_channel_ids`
/// relies on this to produce a stable, deduplicated `node_announcement` ordering.
impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A short channel id: (block height, transaction index, output index) packed
/// into a single 64-bit integer, block height in the high 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block: u32, txindex: u32, outnum: u16) -> Self {
        let raw = ((block as u64 & 0xFF_FFFF) << 40)
            | ((txindex as u64 & 0xFF_FFFF) << 16)
            | (outnum as u64 & 0xFFFF);
        Self(raw)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn block(&self) -> u32 {
        ((self.0 >> 40) & 0xFF_FFFF) as u32
    }

    pub fn txindex(&self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn outnum(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl PartialOrd for ShortChannelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShortChannelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.txindex(), self.outnum())
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 32-byte identifier of the chain this gossip graph describes. Messages
/// carrying a foreign chain hash are silently ignored, not rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHash([u8; 32]);

impl ChainHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainHash({})", hex::encode(self.0))
    }
}

/// The node's own cryptographic identity, standing in for the signer oracle
/// of channel-update / node-announcement bodies (see `crate::signer`).
#[derive(Debug)]
pub struct Identity {
    keypair: SigningKey,
    pub node_id: NodeId,
}

impl Identity {
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let mut secret_key_bytes = [0u8; 32];
        csprng.fill_bytes(&mut secret_key_bytes);
        let keypair = SigningKey::from_bytes(&secret_key_bytes);
        let node_id = NodeId(keypair.verifying_key().to_bytes());
        Self { keypair, node_id }
    }

    /// Loads an identity from a file, or creates and persists a new one if
    /// the file doesn't exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => {
                let keypair_bytes: [u8; 32] =
                    bytes.try_into().map_err(|_| Error::InvalidKeyFile)?;
                let keypair = SigningKey::from_bytes(&keypair_bytes);
                let node_id = NodeId(keypair.verifying_key().to_bytes());
                Ok(Self { keypair, node_id })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::new();
                fs::write(path.as_ref(), identity.keypair.to_bytes())?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn sign_bytes(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.keypair.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies `signature` over `message` was produced by `node_id`.
pub fn verify_signature(
    node_id: &NodeId,
    message: &[u8],
    signature: &ed25519_dalek::Signature,
) -> Result<()> {
    let key = node_id.verifying_key()?;
    key.verify(message, signature)
        .map_err(|_| Error::InvalidSignature)
}
