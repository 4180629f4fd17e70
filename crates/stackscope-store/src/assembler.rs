//! Tile assembly.
//!
//! The assembler is the one place the cache, the coalescer and the chunk
//! store meet: given a tile coordinate it returns the decoded chunk plane,
//! fetching at most once per coordinate however many callers pile on. The
//! public [`tile`](TileAssembler::tile) path never fails; any error degrades
//! to a zero plane so the viewer keeps rendering, and the event is logged.

use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::cache::ChunkCache;
use crate::chunkstore::ChunkStore;
use crate::error::SharedResult;
use crate::singleflight::SingleFlight;
use crate::types::{TILE_BYTES, TileCoord};

/// Shared all-zero plane returned for absent chunks and failures.
fn zero_plane() -> Arc<Vec<u8>> {
    static ZERO: OnceLock<Arc<Vec<u8>>> = OnceLock::new();
    Arc::clone(ZERO.get_or_init(|| Arc::new(vec![0u8; TILE_BYTES])))
}

/// Resolves tile coordinates to decoded chunk planes.
pub struct TileAssembler {
    store: Arc<ChunkStore>,
    cache: Arc<ChunkCache>,
    fetch_flight: SingleFlight<TileCoord, Arc<Vec<u8>>>,
}

impl TileAssembler {
    /// Create an assembler over the given store and cache.
    pub fn new(store: Arc<ChunkStore>, cache: Arc<ChunkCache>) -> Self {
        Self {
            store,
            cache,
            fetch_flight: SingleFlight::new(),
        }
    }

    /// The cache this assembler populates.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Return the plane for `coord`, or a zero plane on any failure.
    ///
    /// This is the path tile endpoints and scheduler workers use; it
    /// preserves visual continuity by never surfacing errors.
    pub async fn tile(&self, coord: &TileCoord) -> Arc<Vec<u8>> {
        match self.try_tile(coord).await {
            Ok(plane) => plane,
            Err(e) => {
                warn!("Serving zero tile for {coord}: {e}");
                zero_plane()
            }
        }
    }

    /// Return the plane for `coord`, surfacing errors.
    ///
    /// Used by the health probe, which must report failures instead of
    /// masking them.
    pub async fn try_tile(&self, coord: &TileCoord) -> SharedResult<Arc<Vec<u8>>> {
        match self.fetch_once(coord).await {
            Err(e) if matches!(*e, crate::error::Error::CoalesceInterrupted) => {
                // The coalesced leader's task was dropped (client went away
                // mid-request). Lead a fresh episode instead of failing the
                // surviving waiters.
                debug!("Fetch leader for {coord} was dropped, retrying");
                self.fetch_once(coord).await
            }
            other => other,
        }
    }

    async fn fetch_once(&self, coord: &TileCoord) -> SharedResult<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(coord) {
            return Ok(hit);
        }

        self.fetch_flight
            .run(coord.clone(), async {
                // A fetch that completed while this caller queued on the
                // same coordinate has already populated the cache.
                if let Some(hit) = self.cache.get(coord) {
                    return Ok(hit);
                }

                let plane = match self.store.read_chunk(coord).await? {
                    Some(plane) => Arc::new(plane),
                    None => {
                        // Cache known gaps so repeated requests for sparse
                        // regions stay off the network.
                        debug!("Chunk {coord} absent, caching zero plane");
                        zero_plane()
                    }
                };

                self.cache.put(coord.clone(), Arc::clone(&plane));
                Ok(plane)
            })
            .await
    }
}
