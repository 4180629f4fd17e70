//! Container and codec parsing for remote microscopy image stacks.
//!
//! A stack archive is a ZIP container holding one Zarr v2 hierarchy: one group
//! at the root and one array per scale level (`scale0`, `scale1`, ...). Chunks
//! are fixed 256x256 `u8` planes compressed with blosc (zstd inner codec in
//! production). This crate provides the pure parsing and decoding half of that
//! pipeline:
//!
//! - [`zip`]: end-of-central-directory and central-directory parsing so a
//!   remote reader can address individual members with ranged requests
//! - [`zarr`]: `.zarray` metadata and chunk member path construction
//! - [`blosc`]: blosc1 frame decoding with zstd/lz4/zlib inner codecs
//! - [`chunk`]: codec dispatch and shaping of decoded bytes into tile planes
//!
//! Nothing in this crate performs I/O; callers feed it byte slices they have
//! already fetched.

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod blosc;
pub mod chunk;
pub mod error;
pub mod zarr;
pub mod zip;

pub use chunk::{CHUNK_DIM, CHUNK_BYTES, decode_chunk, pad_to_plane};
pub use error::{Error, Result};
pub use zarr::{ArrayMeta, Compressor, array_meta_path, chunk_member_path};
pub use zip::{
    MemberEntry, MemberMap, decompress_member, parse_central_directory, parse_eocd,
    parse_local_header_lengths,
};
