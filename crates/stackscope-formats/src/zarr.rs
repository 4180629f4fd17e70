//! Zarr v2 array metadata.
//!
//! Each scale level of a stack archive is one Zarr v2 array stored under
//! `scale{N}/`. The array's `.zarray` member records shape, chunk geometry,
//! dtype and the chunk compressor; a reader must take the codec from here
//! rather than assuming blosc-zstd.

use serde::Deserialize;

use crate::{Error, Result};

/// Chunk compressor, as recorded in `.zarray`.
///
/// `null` means chunks are stored raw.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compressor {
    /// blosc framing; the inner codec lives in `cname`
    Blosc {
        /// Inner codec name ("zstd", "lz4", "lz4hc", "zlib", ...)
        cname: String,
        /// Compression level the writer used
        clevel: i32,
        /// Shuffle filter: 0 none, 1 byte, 2 bit
        shuffle: i32,
        /// Block size hint, 0 for automatic
        #[serde(default)]
        blocksize: i32,
    },
    /// Bare zlib stream
    Zlib {
        /// Compression level the writer used
        level: i32,
    },
    /// Bare zstd stream
    Zstd {
        /// Compression level the writer used
        level: i32,
    },
}

/// Parsed Zarr v2 array metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ArrayMeta {
    /// Zarr format version; must be 2
    pub zarr_format: u8,
    /// Full array shape, rows first
    pub shape: Vec<u64>,
    /// Chunk shape, rows first
    pub chunks: Vec<u64>,
    /// NumPy dtype string; `|u1` for image planes
    pub dtype: String,
    /// Chunk compressor; `None` for raw chunks
    pub compressor: Option<Compressor>,
    /// Memory order; must be C
    pub order: String,
    /// Value used for absent chunks
    #[serde(default)]
    pub fill_value: Option<serde_json::Value>,
}

impl ArrayMeta {
    /// Parse and validate `.zarray` JSON.
    ///
    /// Rejects formats this server cannot serve: non-v2 metadata, dtypes
    /// other than unsigned 8-bit, Fortran ordering and arrays that are not
    /// two-dimensional.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(json)?;

        if meta.zarr_format != 2 {
            return Err(Error::decode(format!(
                "unsupported zarr format {}",
                meta.zarr_format
            )));
        }
        if meta.dtype != "|u1" && meta.dtype != "u1" {
            return Err(Error::UnsupportedDtype {
                dtype: meta.dtype.clone(),
            });
        }
        if meta.order != "C" {
            return Err(Error::UnsupportedOrder {
                order: meta.order.clone(),
            });
        }
        if meta.shape.len() != 2 || meta.chunks.len() != 2 {
            return Err(Error::decode(format!(
                "expected a 2-D array, got shape of rank {}",
                meta.shape.len()
            )));
        }
        if meta.chunks.iter().any(|&c| c == 0) {
            return Err(Error::decode("chunk shape contains zero"));
        }

        Ok(meta)
    }

    /// Chunk shape as `(rows, cols)`.
    pub fn chunk_shape(&self) -> (usize, usize) {
        (self.chunks[0] as usize, self.chunks[1] as usize)
    }

    /// Number of bytes in one uncompressed chunk.
    pub fn chunk_bytes(&self) -> usize {
        let (rows, cols) = self.chunk_shape();
        rows * cols
    }
}

/// Archive member path of a scale level's `.zarray` metadata.
pub fn array_meta_path(scale: u8) -> String {
    format!("scale{scale}/.zarray")
}

/// Archive member path of one chunk.
///
/// Zarr names chunks by their grid coordinates joined with dots, row index
/// first; scale levels are directories.
pub fn chunk_member_path(scale: u8, y: u32, x: u32) -> String {
    format!("scale{scale}/{y}.{x}")
}
