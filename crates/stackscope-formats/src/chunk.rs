//! Chunk decoding and shaping.
//!
//! Bridges the container modules: takes the raw bytes of one archive member,
//! applies the codec the array metadata declares, and shapes the result into
//! the fixed tile plane the server hands to the compositor.

use std::io::Read;
use tracing::trace;

use crate::zarr::{ArrayMeta, Compressor};
use crate::{Error, Result, blosc};

/// Side length of a chunk (and of a served tile), in pixels.
pub const CHUNK_DIM: usize = 256;

/// Byte size of one uncompressed chunk plane.
pub const CHUNK_BYTES: usize = CHUNK_DIM * CHUNK_DIM;

/// Decode one chunk member into its uncompressed bytes.
///
/// The codec comes from the array metadata, never from assumption; the
/// decoded length is validated against the metadata's chunk byte count.
pub fn decode_chunk(meta: &ArrayMeta, raw: &[u8]) -> Result<Vec<u8>> {
    let expected = meta.chunk_bytes();

    let decoded = match &meta.compressor {
        None => raw.to_vec(),
        Some(Compressor::Blosc { cname, .. }) => {
            // The blosc frame flags carry the codec as well; parsing trusts
            // the frame, but a cname we cannot decode fails up front.
            match cname.as_str() {
                "zstd" | "lz4" | "lz4hc" | "zlib" => {}
                other => return Err(Error::unsupported_codec(format!("blosc cname {other}"))),
            }
            blosc::decompress(raw, expected)?
        }
        Some(Compressor::Zstd { .. }) => zstd::bulk::decompress(raw, expected)
            .map_err(|e| Error::decode(format!("zstd chunk: {e}")))?,
        Some(Compressor::Zlib { .. }) => {
            let mut decoded = Vec::with_capacity(expected);
            flate2::read::ZlibDecoder::new(raw)
                .read_to_end(&mut decoded)
                .map_err(|e| Error::decode(format!("zlib chunk: {e}")))?;
            decoded
        }
    };

    if decoded.len() != expected {
        return Err(Error::decode(format!(
            "chunk decoded to {} bytes, metadata expects {expected}",
            decoded.len()
        )));
    }
    Ok(decoded)
}

/// Shape decoded chunk bytes into a `CHUNK_DIM` × `CHUNK_DIM` plane.
///
/// Chunks whose declared shape is smaller than the tile are zero-padded into
/// the top-left corner; larger shapes contribute only their overlapping
/// region. Data is never truncated to a partial row.
pub fn pad_to_plane(decoded: &[u8], rows: usize, cols: usize) -> Vec<u8> {
    if rows == CHUNK_DIM && cols == CHUNK_DIM && decoded.len() == CHUNK_BYTES {
        return decoded.to_vec();
    }

    trace!("padding {rows}x{cols} chunk to {CHUNK_DIM}x{CHUNK_DIM}");
    let mut plane = vec![0u8; CHUNK_BYTES];
    let copy_rows = rows.min(CHUNK_DIM);
    let copy_cols = cols.min(CHUNK_DIM);
    for r in 0..copy_rows {
        let src = r * cols;
        let dst = r * CHUNK_DIM;
        plane[dst..dst + copy_cols].copy_from_slice(&decoded[src..src + copy_cols]);
    }
    plane
}
