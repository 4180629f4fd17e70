//! Legacy unpacked-layout chunk reads.
//!
//! Older datasets were uploaded one object per chunk
//! (`{timestamp}/{channel}/scale{z}/{y}.{x}`) instead of a packed archive.
//! This shim serves those under the same read contract as the archive path:
//! one signed URL and one GET per chunk, blosc-decoded from the frame's own
//! header since no array metadata exists in this layout.

use std::sync::Arc;
use tracing::{debug, trace};

use stackscope_formats::{CHUNK_BYTES, blosc};

use crate::error::{Error, Result};
use crate::provider::SignedUrlProvider;
use crate::transport::RangeTransport;
use crate::types::TileCoord;

/// Reader for the legacy one-object-per-chunk layout.
pub struct DirectChunkReader {
    provider: Arc<dyn SignedUrlProvider>,
    transport: Arc<RangeTransport>,
}

impl DirectChunkReader {
    /// Create a reader over the given collaborator and transport.
    pub fn new(provider: Arc<dyn SignedUrlProvider>, transport: Arc<RangeTransport>) -> Self {
        Self { provider, transport }
    }

    /// Read one chunk; `Ok(None)` when the object is absent.
    pub async fn read_chunk(&self, coord: &TileCoord) -> Result<Option<Vec<u8>>> {
        let key = coord.archive_key();
        let path = key.direct_chunk_path(coord.scale, coord.y, coord.x);

        let url = match self.provider.signed_url(&key.dataset, &path).await {
            Ok(url) => url,
            Err(Error::UrlUnavailable { .. }) => {
                // Sparse absence: the metadata service has no such object.
                trace!("Direct chunk {path} has no signed URL, treating as absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let bytes = match self.transport.get_full(&url).await {
            Ok(bytes) => bytes,
            Err(Error::ArchiveNotFound) => {
                trace!("Direct chunk {path} absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // Legacy chunks are bare blosc frames; the frame header is the only
        // metadata available and must describe a full 256x256 plane.
        let header = blosc::parse_header(&bytes)?;
        let plane = blosc::decompress(&bytes, header.nbytes)?;
        if plane.len() != CHUNK_BYTES {
            return Err(Error::Format(stackscope_formats::Error::decode(format!(
                "direct chunk {path} decoded to {} bytes",
                plane.len()
            ))));
        }

        debug!("Read direct chunk {path}");
        Ok(Some(plane))
    }
}
