//! Opened archive handles.
//!
//! An [`ArchiveHandle`] is a ready-to-read view over one remote stack
//! archive: its member directory, the signed URL it was opened with and the
//! lazily loaded per-scale array metadata. Handles are immutable after open;
//! when a lease ages out the [`crate::chunkstore::ChunkStore`] replaces the
//! whole handle rather than mutating it, so concurrent readers keep a
//! consistent view until their `Arc` drops.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use stackscope_formats::zip::{LOCAL_HEADER_LEN, TAIL_FETCH_LEN};
use stackscope_formats::{
    ArrayMeta, MemberEntry, MemberMap, array_meta_path, chunk_member_path, decode_chunk,
    decompress_member, pad_to_plane, parse_central_directory, parse_eocd,
    parse_local_header_lengths,
};

use crate::error::Result;
use crate::transport::RangeTransport;
use crate::types::{ArchiveKey, UrlLease};

/// A ready-to-read view over one remote stack archive.
pub struct ArchiveHandle {
    key: ArchiveKey,
    lease: UrlLease,
    members: MemberMap,
    arrays: RwLock<HashMap<u8, Option<Arc<ArrayMeta>>>>,
    data_offsets: DashMap<String, u64>,
    transport: Arc<RangeTransport>,
}

impl ArchiveHandle {
    /// Open the archive behind `lease`.
    ///
    /// Costs one suffix fetch to find the directory and, for archives whose
    /// directory does not fit in the tail, one more ranged read. No member
    /// payloads are downloaded.
    pub async fn open(
        key: ArchiveKey,
        lease: UrlLease,
        transport: Arc<RangeTransport>,
    ) -> Result<Self> {
        let tail = transport.get_suffix(&lease.url, TAIL_FETCH_LEN).await?;
        let location = parse_eocd(&tail.bytes, tail.file_size)?;

        let tail_start = tail.file_size - tail.bytes.len() as u64;
        let members = if location.offset >= tail_start
            && location.offset + location.size <= tail.file_size
        {
            let start = (location.offset - tail_start) as usize;
            let directory = &tail.bytes[start..start + location.size as usize];
            parse_central_directory(directory, &location)?
        } else {
            let directory = transport
                .get_range(&lease.url, location.offset, location.size)
                .await?;
            parse_central_directory(&directory, &location)?
        };

        debug!("Opened archive {key}: {} members", members.len());
        Ok(Self {
            key,
            lease,
            members,
            arrays: RwLock::new(HashMap::new()),
            data_offsets: DashMap::new(),
            transport,
        })
    }

    /// The archive key this handle serves.
    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    /// The lease the handle was opened with.
    pub fn lease(&self) -> &UrlLease {
        &self.lease
    }

    /// Whether the handle's lease still clears the safety margin.
    pub fn is_fresh(&self, now: u64, safety_margin: u64) -> bool {
        self.lease.is_fresh(now, safety_margin)
    }

    /// Number of members in the archive.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Read one chunk as a full tile plane.
    ///
    /// Returns `None` when the scale level or the chunk member is absent;
    /// sparse arrays simply omit empty chunks. At most one chunk's worth of
    /// payload is downloaded.
    pub async fn read_chunk(&self, scale: u8, y: u32, x: u32) -> Result<Option<Vec<u8>>> {
        let Some(meta) = self.array_meta(scale).await? else {
            trace!("Archive {} has no scale{scale}", self.key);
            return Ok(None);
        };

        let member = chunk_member_path(scale, y, x);
        let Some(entry) = self.members.get(&member) else {
            trace!("Chunk {member} absent in {}", self.key);
            return Ok(None);
        };

        let raw = self.member_bytes(&member, entry).await?;
        let decoded = decode_chunk(&meta, &raw)?;
        let (rows, cols) = meta.chunk_shape();
        Ok(Some(pad_to_plane(&decoded, rows, cols)))
    }

    /// Load (or return the cached) array metadata for one scale level.
    async fn array_meta(&self, scale: u8) -> Result<Option<Arc<ArrayMeta>>> {
        if let Some(meta) = self.arrays.read().await.get(&scale) {
            return Ok(meta.clone());
        }

        let mut arrays = self.arrays.write().await;
        if let Some(meta) = arrays.get(&scale) {
            return Ok(meta.clone());
        }

        let path = array_meta_path(scale);
        let meta = match self.members.get(&path) {
            None => None,
            Some(entry) => {
                let raw = self.member_bytes(&path, entry).await?;
                Some(Arc::new(ArrayMeta::parse(&raw)?))
            }
        };
        arrays.insert(scale, meta.clone());
        Ok(meta)
    }

    /// Fetch and decompress one member's payload.
    async fn member_bytes(&self, name: &str, entry: &MemberEntry) -> Result<Vec<u8>> {
        let data_offset = match self.data_offsets.get(name) {
            Some(offset) => *offset,
            None => {
                // The local header's name/extra lengths can differ from the
                // central directory's, so probe before computing the range.
                let probe = self
                    .transport
                    .get_range(&self.lease.url, entry.header_offset, LOCAL_HEADER_LEN as u64)
                    .await?;
                let (name_len, extra_len) = parse_local_header_lengths(&probe)?;
                let offset =
                    entry.header_offset + (LOCAL_HEADER_LEN + name_len + extra_len) as u64;
                self.data_offsets.insert(name.to_string(), offset);
                offset
            }
        };

        let raw = self
            .transport
            .get_range(&self.lease.url, data_offset, entry.compressed_size)
            .await?;
        Ok(decompress_member(name, entry, &raw)?)
    }
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("key", &self.key)
            .field("members", &self.members.len())
            .field("expires_at", &self.lease.expires_at)
            .finish()
    }
}
