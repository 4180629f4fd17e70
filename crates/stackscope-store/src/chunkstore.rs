//! Keyed store of opened archive handles.
//!
//! Owns at most one [`ArchiveHandle`] per archive key. Opens are coalesced so
//! a cold archive hit by a burst of tile requests is opened once; a handle
//! whose lease falls inside the safety margin is replaced by a freshly opened
//! one (readers holding the old `Arc` finish undisturbed). Transport failures
//! and expired signatures invalidate the lease and retry exactly once.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::archive::ArchiveHandle;
use crate::direct::DirectChunkReader;
use crate::error::{Error, SharedResult};
use crate::registry::UrlRegistry;
use crate::singleflight::SingleFlight;
use crate::transport::RangeTransport;
use crate::types::{ArchiveKey, DEFAULT_SAFETY_MARGIN_SECS, TileCoord};

/// Store of opened archives, one handle per key.
pub struct ChunkStore {
    registry: Arc<UrlRegistry>,
    transport: Arc<RangeTransport>,
    handles: RwLock<HashMap<ArchiveKey, Arc<ArchiveHandle>>>,
    open_flight: SingleFlight<ArchiveKey, Arc<ArchiveHandle>>,
    direct: DirectChunkReader,
    /// Datasets discovered to ship the legacy unpacked layout.
    direct_mode: DashMap<ArchiveKey, ()>,
    safety_margin: u64,
}

impl ChunkStore {
    /// Create a store with the default lease safety margin.
    pub fn new(
        registry: Arc<UrlRegistry>,
        transport: Arc<RangeTransport>,
        direct: DirectChunkReader,
    ) -> Self {
        Self::with_safety_margin(registry, transport, direct, DEFAULT_SAFETY_MARGIN_SECS)
    }

    /// Create a store with a custom lease safety margin in seconds.
    pub fn with_safety_margin(
        registry: Arc<UrlRegistry>,
        transport: Arc<RangeTransport>,
        direct: DirectChunkReader,
        safety_margin: u64,
    ) -> Self {
        Self {
            registry,
            transport,
            handles: RwLock::new(HashMap::new()),
            open_flight: SingleFlight::new(),
            direct,
            direct_mode: DashMap::new(),
            safety_margin,
        }
    }

    /// Get the open handle for `key`, opening or replacing as needed.
    pub async fn handle(&self, key: &ArchiveKey) -> SharedResult<Arc<ArchiveHandle>> {
        let now = self.registry.now();
        if let Some(handle) = self.handles.read().get(key) {
            if handle.is_fresh(now, self.safety_margin) {
                return Ok(Arc::clone(handle));
            }
            debug!("Handle for {key} is inside the lease safety margin, reopening");
        }

        self.open_flight
            .run(key.clone(), async {
                let now = self.registry.now();
                if let Some(handle) = self.handles.read().get(key) {
                    if handle.is_fresh(now, self.safety_margin) {
                        return Ok(Arc::clone(handle));
                    }
                }

                let lease = self.registry.lease(key).await?;
                let handle = Arc::new(
                    ArchiveHandle::open(key.clone(), lease, Arc::clone(&self.transport))
                        .await
                        .map_err(Arc::new)?,
                );
                // Replacing (not mutating) the entry lets in-flight readers
                // of the old handle drain on their own Arc.
                self.handles
                    .write()
                    .insert(key.clone(), Arc::clone(&handle));
                Ok(handle)
            })
            .await
    }

    /// Read the chunk behind `coord` as a full tile plane.
    ///
    /// `Ok(None)` means the chunk (or its whole scale level) is absent.
    /// Expired signatures and transport failures refresh the lease and retry
    /// the open/read pair once before surfacing.
    pub async fn read_chunk(&self, coord: &TileCoord) -> SharedResult<Option<Vec<u8>>> {
        let key = coord.archive_key();

        if self.direct_mode.contains_key(&key) {
            return self.direct.read_chunk(coord).await.map_err(Arc::new);
        }

        let mut refreshed = false;
        loop {
            let handle = match self.handle(&key).await {
                Ok(handle) => handle,
                Err(e) if matches!(*e, Error::ArchiveNotFound) => {
                    // No packed archive for this key; fall back to the
                    // legacy one-object-per-chunk layout and remember.
                    debug!("{key} has no packed archive, switching to direct chunk reads");
                    self.direct_mode.insert(key.clone(), ());
                    return self.direct.read_chunk(coord).await.map_err(Arc::new);
                }
                Err(e) if !refreshed && e.needs_url_refresh() => {
                    warn!("Open of {key} failed ({e}), refreshing lease and retrying");
                    self.registry.invalidate(&key);
                    refreshed = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match handle.read_chunk(coord.scale, coord.y, coord.x).await {
                Ok(plane) => return Ok(plane),
                Err(e) if !refreshed && e.needs_url_refresh() => {
                    warn!("Read of {coord} failed ({e}), refreshing lease and retrying");
                    self.registry.invalidate(&key);
                    self.drop_handle(&key, &handle);
                    refreshed = true;
                }
                Err(e) => return Err(Arc::new(e)),
            }
        }
    }

    /// Number of archives currently held open.
    pub fn open_count(&self) -> usize {
        self.handles.read().len()
    }

    /// Remove `stale` from the handle map, unless it was already replaced.
    fn drop_handle(&self, key: &ArchiveKey, stale: &Arc<ArchiveHandle>) {
        let mut handles = self.handles.write();
        if let Some(current) = handles.get(key) {
            if Arc::ptr_eq(current, stale) {
                handles.remove(key);
            }
        }
    }
}
