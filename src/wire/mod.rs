//! src/wire/mod.rs
//!
//! Wire-format types for the gossip protocol: message bodies and the
//! short-channel-id list compression envelope.

pub mod messages;
pub mod scid_codec;

pub use messages::*;
pub use scid_codec::{decode_scids, encode_scids, ScidEncoding};
