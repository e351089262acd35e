//! src/wire/scid_codec.rs
//!
//! Encodes and decodes lists of short channel ids with an optional zlib
//! compression envelope, as carried by `query_short_channel_ids` and
//! `reply_channel_range`.

use crate::domain::ShortChannelId;
use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// The one-byte envelope tag prefixing an encoded SCID list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScidEncoding {
    Uncompressed = 0,
    Zlib = 1,
}

impl ScidEncoding {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ScidEncoding::Uncompressed),
            1 => Ok(ScidEncoding::Zlib),
            other => Err(Error::ScidEnvelopeUnknown(other)),
        }
    }
}

/// Encodes `scids` into the envelope-tagged wire form, choosing whichever of
/// uncompressed or zlib is strictly smaller. Fails if the resulting encoding
/// would exceed `max_encode_size`.
pub fn encode_scids(scids: &[ShortChannelId], max_encode_size: usize) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(scids.len() * 8);
    for scid in scids {
        raw.extend_from_slice(&scid.as_u64().to_be_bytes());
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&raw)
        .map_err(|e| Error::ScidCodec(format!("zlib compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::ScidCodec(format!("zlib compression failed: {e}")))?;

    let (tag, body) = if compressed.len() < raw.len() {
        (ScidEncoding::Zlib, compressed)
    } else {
        (ScidEncoding::Uncompressed, raw)
    };

    if body.len() + 1 > max_encode_size {
        return Err(Error::ScidCodec(format!(
            "encoded scid list ({} bytes) exceeds max_encode_size ({})",
            body.len() + 1,
            max_encode_size
        )));
    }

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes an envelope-tagged SCID list, inflating if necessary. `max_inflate_size`
/// bounds the decompressed size to guard against a zip-bomb style peer.
pub fn decode_scids(data: &[u8], max_inflate_size: usize) -> Result<Vec<ShortChannelId>> {
    let (&tag, body) = data
        .split_first()
        .ok_or_else(|| Error::ScidCodec("empty scid list payload".to_string()))?;

    let raw = match ScidEncoding::from_tag(tag)? {
        ScidEncoding::Uncompressed => body.to_vec(),
        ScidEncoding::Zlib => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            let mut limited = (&mut decoder).take(max_inflate_size as u64 + 1);
            limited
                .read_to_end(&mut out)
                .map_err(|e| Error::ScidCodec(format!("zlib inflate failed: {e}")))?;
            if out.len() > max_inflate_size {
                return Err(Error::ScidCodec(
                    "decompressed scid list exceeds max_inflate_size".to_string(),
                ));
            }
            out
        }
    };

    if raw.len() % 8 != 0 {
        return Err(Error::ScidCodec(format!(
            "scid list payload length {} is not a multiple of 8",
            raw.len()
        )));
    }

    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            ShortChannelId::from_u64(u64::from_be_bytes(bytes))
        })
        .collect())
}
