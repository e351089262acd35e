//! src/error.rs
//!
//! The library's comprehensive `Error` enum. Variants are grouped, in doc
//! comments, by the severity tier that governs how the caller must react:
//! tier 1-3 (log and continue / drop message / disconnect peer), tier 4
//! (reply to control with an error, keep running), tier 5 (signer failure,
//! fatal), tier 6 (internal invariant violation, fatal).

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    // --- Tier 1: malformed wire data from a peer, log and ignore the message ---
    #[error("failed to decode wire message: {0}")]
    WireDecode(String),

    #[error("unknown gossip message type {0}")]
    UnknownMessageType(u16),

    // --- Tier 2: semantically invalid gossip content, drop and possibly penalize ---
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("scid list codec error: {0}")]
    ScidCodec(String),

    #[error("channel range overflow: first_blocknum + number_of_blocks exceeds u32::MAX")]
    ChannelRangeOverflow,

    // --- Tier 3: peer protocol violation, close the peer's session ---
    #[error("peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    #[error("duplicate peer session for node {0}")]
    DuplicatePeerSession(String),

    // --- Tier 4: control-plane request failure, reply with an error but keep running ---
    #[error("control request failed: {0}")]
    ControlRequest(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    // --- Tier 5: signer oracle failure, fatal ---
    #[error("signer failed to produce a signature: {0}")]
    SignerFailure(String),

    // --- Tier 6: internal invariant violation, fatal ---
    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("unknown scid envelope tag {0}: the codec only understands the tags it itself defines")]
    ScidEnvelopeUnknown(u8),

    #[error("control connection closed unexpectedly")]
    ControlGone,

    // --- Ambient infrastructure errors ---
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("cryptography error: {0}")]
    Crypto(#[from] ed25519_dalek::SignatureError),

    #[error("invalid identity key file")]
    InvalidKeyFile,

    #[error("tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to initiate connection to {0}: {1}")]
    ConnectFailed(std::net::SocketAddr, #[source] quinn::ConnectError),

    #[error("connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(std::net::SocketAddr, #[source] quinn::ConnectionError),

    #[error("an established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),
}

impl Error {
    /// The severity tier this error belongs to, used by callers that need to
    /// decide whether to log-and-continue, close a peer, or abort the process.
    pub fn severity(&self) -> Severity {
        use Error::*;
        match self {
            WireDecode(_) | UnknownMessageType(_) => Severity::MalformedMessage,
            InvalidSignature | ScidCodec(_) | ChannelRangeOverflow => Severity::InvalidContent,
            PeerProtocolViolation(_) | DuplicatePeerSession(_) => Severity::ProtocolViolation,
            ControlRequest(_) | UnknownChannel(_) => Severity::ControlRequestFailure,
            SignerFailure(_) => Severity::SignerFailure,
            Internal(_) | ControlGone | ScidEnvelopeUnknown(_) => Severity::Internal,
            _ => Severity::Internal,
        }
    }
}

/// The five-tier (plus an implicit "ambient infra" sixth) severity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and ignore the single malformed message.
    MalformedMessage,
    /// Drop the message, no further action.
    InvalidContent,
    /// Close the offending peer's session.
    ProtocolViolation,
    /// Reply to control with an error; the daemon keeps running.
    ControlRequestFailure,
    /// The signer is unavailable or returned garbage; fatal.
    SignerFailure,
    /// An invariant this code relies on was violated; fatal, process exits.
    Internal,
}
