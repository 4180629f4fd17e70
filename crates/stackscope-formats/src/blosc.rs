//! blosc1 frame decoding.
//!
//! Stack archive chunks are compressed with blosc (zstd inner codec, clevel 5,
//! byte shuffle) by the acquisition pipeline. A blosc1 frame is a 16-byte
//! header followed either by a raw copy of the payload (memcpy flag) or by a
//! block offset table and independently compressed blocks. Each block carries
//! a 4-byte little-endian compressed length prefix.
//!
//! The fast split-block layouts produced by blosclz and snappy are not
//! emitted for this data (typesize 1 never splits) and are rejected rather
//! than mis-decoded.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use tracing::trace;

use crate::{Error, Result};

/// Size of the fixed blosc1 header.
pub const HEADER_LEN: usize = 16;

const FLAG_BYTE_SHUFFLE: u8 = 0x01;
const FLAG_MEMCPY: u8 = 0x02;
const FLAG_BIT_SHUFFLE: u8 = 0x04;

/// Inner codec recorded in a blosc frame's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerCodec {
    /// blosclz (unsupported)
    BloscLz,
    /// LZ4 / LZ4HC block format
    Lz4,
    /// Snappy (unsupported)
    Snappy,
    /// zlib
    Zlib,
    /// Zstandard
    Zstd,
}

impl InnerCodec {
    fn from_flags(flags: u8) -> Result<Self> {
        match flags >> 5 {
            0 => Ok(Self::BloscLz),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Snappy),
            3 => Ok(Self::Zlib),
            4 => Ok(Self::Zstd),
            other => Err(Error::unsupported_codec(format!(
                "blosc compressor code {other}"
            ))),
        }
    }
}

/// Parsed blosc1 frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Element size in bytes; 1 for u8 image planes
    pub typesize: usize,
    /// Uncompressed payload size
    pub nbytes: usize,
    /// Uncompressed size of each full block
    pub blocksize: usize,
    /// Total frame size including the header
    pub cbytes: usize,
    /// Byte-shuffle filter was applied
    pub shuffled: bool,
    /// Payload is stored uncompressed
    pub memcpyed: bool,
    /// Inner codec for the block payloads
    pub codec: InnerCodec,
}

/// Parse a frame header from the first [`HEADER_LEN`] bytes.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader> {
    if data.len() < HEADER_LEN {
        return Err(Error::truncated(HEADER_LEN, data.len()));
    }
    let version = data[0];
    if !(1..=2).contains(&version) {
        return Err(Error::decode(format!("unsupported blosc version {version}")));
    }
    let flags = data[2];
    if flags & FLAG_BIT_SHUFFLE != 0 {
        return Err(Error::unsupported_codec("blosc bit-shuffle filter"));
    }

    let mut rdr = Cursor::new(&data[4..HEADER_LEN]);
    let nbytes = rdr.read_u32::<LittleEndian>()? as usize;
    let blocksize = rdr.read_u32::<LittleEndian>()? as usize;
    let cbytes = rdr.read_u32::<LittleEndian>()? as usize;

    Ok(FrameHeader {
        typesize: data[3] as usize,
        nbytes,
        blocksize,
        cbytes,
        shuffled: flags & FLAG_BYTE_SHUFFLE != 0,
        memcpyed: flags & FLAG_MEMCPY != 0,
        codec: InnerCodec::from_flags(flags)?,
    })
}

/// Decompress a complete blosc1 frame.
///
/// `expected_nbytes` guards against frames whose header disagrees with the
/// array metadata; pass the chunk's byte count.
pub fn decompress(data: &[u8], expected_nbytes: usize) -> Result<Vec<u8>> {
    let header = parse_header(data)?;

    if header.nbytes != expected_nbytes {
        return Err(Error::decode(format!(
            "frame holds {} bytes, chunk expects {expected_nbytes}",
            header.nbytes
        )));
    }
    if header.cbytes != data.len() {
        return Err(Error::decode(format!(
            "frame length {} disagrees with header cbytes {}",
            data.len(),
            header.cbytes
        )));
    }

    trace!(
        "blosc frame: {} -> {} bytes, codec {:?}, shuffle {}",
        header.cbytes, header.nbytes, header.codec, header.shuffled
    );

    if header.nbytes == 0 {
        return Ok(Vec::new());
    }

    let mut out = if header.memcpyed {
        if data.len() < HEADER_LEN + header.nbytes {
            return Err(Error::truncated(HEADER_LEN + header.nbytes, data.len()));
        }
        data[HEADER_LEN..HEADER_LEN + header.nbytes].to_vec()
    } else {
        decompress_blocks(data, &header)?
    };

    if header.shuffled && !header.memcpyed && header.typesize > 1 {
        out = unshuffle(&out, header.typesize);
    }

    Ok(out)
}

fn decompress_blocks(data: &[u8], header: &FrameHeader) -> Result<Vec<u8>> {
    if header.blocksize == 0 {
        return Err(Error::decode("blosc frame has zero blocksize"));
    }
    match header.codec {
        InnerCodec::BloscLz | InnerCodec::Snappy => {
            return Err(Error::unsupported_codec(format!("{:?}", header.codec)));
        }
        // Split sub-streams only occur for typesize > 1 with the fast codecs.
        InnerCodec::Lz4 if header.typesize > 1 => {
            return Err(Error::unsupported_codec("blosc lz4 split layout"));
        }
        _ => {}
    }

    let nblocks = header.nbytes.div_ceil(header.blocksize);
    let table_end = HEADER_LEN + nblocks * 4;
    if data.len() < table_end {
        return Err(Error::truncated(table_end, data.len()));
    }

    let mut bstarts = Vec::with_capacity(nblocks);
    let mut rdr = Cursor::new(&data[HEADER_LEN..table_end]);
    for _ in 0..nblocks {
        bstarts.push(rdr.read_u32::<LittleEndian>()? as usize);
    }

    let mut out = Vec::with_capacity(header.nbytes);
    for (j, &bstart) in bstarts.iter().enumerate() {
        let remaining = header.nbytes - j * header.blocksize;
        let block_nbytes = remaining.min(header.blocksize);

        if data.len() < bstart + 4 {
            return Err(Error::truncated(bstart + 4, data.len()));
        }
        let compressed_len =
            u32::from_le_bytes([data[bstart], data[bstart + 1], data[bstart + 2], data[bstart + 3]])
                as usize;
        let block_start = bstart + 4;
        if data.len() < block_start + compressed_len {
            return Err(Error::truncated(block_start + compressed_len, data.len()));
        }
        let block = &data[block_start..block_start + compressed_len];

        if compressed_len == block_nbytes {
            // Incompressible block, stored verbatim.
            out.extend_from_slice(block);
            continue;
        }

        let decoded = match header.codec {
            InnerCodec::Zstd => zstd::bulk::decompress(block, block_nbytes)
                .map_err(|e| Error::decode(format!("zstd block {j}: {e}")))?,
            InnerCodec::Lz4 => lz4_flex::block::decompress(block, block_nbytes)
                .map_err(|e| Error::decode(format!("lz4 block {j}: {e}")))?,
            InnerCodec::Zlib => {
                let mut decoded = Vec::with_capacity(block_nbytes);
                flate2::read::ZlibDecoder::new(block)
                    .read_to_end(&mut decoded)
                    .map_err(|e| Error::decode(format!("zlib block {j}: {e}")))?;
                decoded
            }
            InnerCodec::BloscLz | InnerCodec::Snappy => unreachable!(),
        };
        if decoded.len() != block_nbytes {
            return Err(Error::decode(format!(
                "block {j} decoded to {} bytes, expected {block_nbytes}",
                decoded.len()
            )));
        }
        out.extend_from_slice(&decoded);
    }

    if out.len() != header.nbytes {
        return Err(Error::decode(format!(
            "frame decoded to {} bytes, expected {}",
            out.len(),
            header.nbytes
        )));
    }
    Ok(out)
}

/// Reverse the blosc byte-shuffle filter.
///
/// The shuffle groups the k-th byte of every element together; a no-op for
/// typesize 1, so the u8 production path never reaches this.
fn unshuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    let elements = data.len() / typesize;
    let split = elements * typesize;
    let mut out = vec![0u8; data.len()];
    for (i, item) in out.iter_mut().take(split).enumerate() {
        let element = i / typesize;
        let byte = i % typesize;
        *item = data[byte * elements + element];
    }
    // Trailing bytes that do not form a whole element are left unshuffled.
    out[split..].copy_from_slice(&data[split..]);
    out
}
