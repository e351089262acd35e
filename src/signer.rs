//! src/signer.rs
//!
//! The synchronous signing oracle abstraction: local channel updates and our
//! own node announcement are signed by asking an external signer (an HSM, in
//! the real daemon) for exactly one signature at a time. The engine never
//! holds the node's private key directly; `Signer` is the seam.

use crate::error::{Error, Result};
use async_trait::async_trait;
use ed25519_dalek::Signature;
use tokio::sync::Mutex;

/// A synchronous (one outstanding request at a time) signing oracle.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, message: &[u8]) -> Result<Signature>;
}

/// The default signer: a local ed25519 identity guarded by a mutex so that,
/// as with the real HSM, only one signing request is ever in flight.
pub struct LocalSigner {
    identity: Mutex<crate::domain::Identity>,
}

impl LocalSigner {
    pub fn new(identity: crate::domain::Identity) -> Self {
        Self {
            identity: Mutex::new(identity),
        }
    }

    pub async fn node_id(&self) -> crate::domain::NodeId {
        self.identity.lock().await.node_id
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, message: &[u8]) -> Result<Signature> {
        let identity = self.identity.lock().await;
        Ok(identity.sign_bytes(message))
    }
}

/// A signer stand-in for tests that always fails, to exercise the fatal
/// `SignerFailure` path (tier 5) without needing a real broken HSM.
pub struct FailingSigner;

#[async_trait]
impl Signer for FailingSigner {
    async fn sign(&self, _message: &[u8]) -> Result<Signature> {
        Err(Error::SignerFailure("test signer always fails".to_string()))
    }
}
