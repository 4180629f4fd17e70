//! The tile service: the four operations the HTTP facade exposes.
//!
//! Components are constructed once at startup and shared by `Arc`; the
//! service owns no global state. Tile operations submit work to the
//! scheduler for ordering, then resolve synchronously through the assembler
//! (the scheduler is an optimization, never a gate), and degrade to black
//! tiles rather than failing. Health is the only error-surfacing operation.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use stackscope_compose::compose::{black_gray_png, black_rgb_png, compose_merged, compose_single};
use stackscope_compose::settings::SettingsMap;
use stackscope_store::assembler::TileAssembler;
use stackscope_store::cache::ChunkCache;
use stackscope_store::chunkstore::ChunkStore;
use stackscope_store::direct::DirectChunkReader;
use stackscope_store::provider::{HttpSignedUrlProvider, SignedUrlProvider};
use stackscope_store::registry::UrlRegistry;
use stackscope_store::scheduler::TileScheduler;
use stackscope_store::transport::RangeTransport;
use stackscope_store::types::{ChannelId, TileCoord};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::http::create_router;

/// Structured health probe result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `"ok"` or `"error"`
    pub status: &'static str,
    /// Failure detail when status is `"error"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Bytes held by the chunk cache
    pub cache_bytes: usize,
    /// Entries held by the chunk cache
    pub cache_entries: usize,
    /// Lifetime cache hits
    pub cache_hits: u64,
    /// Lifetime cache misses
    pub cache_misses: u64,
    /// Jobs waiting in the scheduler queue
    pub queue_depth: usize,
    /// Archives currently held open
    pub open_archives: usize,
}

impl HealthReport {
    /// Whether the probe succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// The public tile API consumed by the HTTP facade.
pub struct TileService {
    assembler: Arc<TileAssembler>,
    store: Arc<ChunkStore>,
    scheduler: Arc<TileScheduler>,
    cache: Arc<ChunkCache>,
    tile_timeout: Duration,
    merged_timeout: Duration,
    health_timeout: Duration,
    default_timestamp: String,
    probe: TileCoord,
}

impl TileService {
    /// Wire a service from pre-built components and configuration.
    pub fn new(
        assembler: Arc<TileAssembler>,
        store: Arc<ChunkStore>,
        scheduler: Arc<TileScheduler>,
        cache: Arc<ChunkCache>,
        config: &ServerConfig,
    ) -> Self {
        let probe = TileCoord {
            dataset: config.probe_dataset.clone(),
            timestamp: config.probe_timestamp().to_string(),
            channel: ChannelId::BrightField,
            scale: 0,
            x: 0,
            y: 0,
        };
        Self {
            assembler,
            store,
            scheduler,
            cache,
            tile_timeout: Duration::from_secs(config.tile_timeout_secs),
            merged_timeout: Duration::from_secs(config.merged_timeout_secs),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            default_timestamp: config.default_timestamp.clone(),
            probe,
        }
    }

    /// Timestamp substituted when a request omits one.
    pub fn default_timestamp(&self) -> &str {
        &self.default_timestamp
    }

    /// Serve one channel as a grayscale PNG.
    ///
    /// Never fails: timeouts and internal errors produce the black tile.
    pub async fn get_tile(
        &self,
        coord: TileCoord,
        settings: &SettingsMap,
        priority: i32,
    ) -> Vec<u8> {
        self.scheduler.submit(coord.clone(), priority);

        let composed = timeout(self.tile_timeout, async {
            let plane = self.assembler.tile(&coord).await;
            compose_single(&plane, coord.channel, settings)
        })
        .await;

        match composed {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => {
                warn!("Compose failed for {coord}: {e}; serving black tile");
                black_gray_png().unwrap_or_default()
            }
            Err(_) => {
                warn!("Tile {coord} exceeded {:?}; serving black tile", self.tile_timeout);
                black_gray_png().unwrap_or_default()
            }
        }
    }

    /// Serve up to five channels composed into one RGB PNG.
    pub async fn get_merged_tile(
        &self,
        coord: TileCoord,
        channels: &[ChannelId],
        settings: &SettingsMap,
        priority: i32,
    ) -> Vec<u8> {
        let coords: Vec<TileCoord> =
            channels.iter().map(|c| coord.with_channel(*c)).collect();
        for c in &coords {
            self.scheduler.submit(c.clone(), priority);
        }

        let composed = timeout(self.merged_timeout, async {
            let planes =
                futures::future::join_all(coords.iter().map(|c| self.assembler.tile(c))).await;
            let layers: Vec<(ChannelId, &[u8])> = channels
                .iter()
                .zip(planes.iter())
                .map(|(channel, plane)| (*channel, plane.as_slice()))
                .collect();
            compose_merged(&layers, settings)
        })
        .await;

        match composed {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => {
                warn!("Merged compose failed for {coord}: {e}; serving black tile");
                black_rgb_png().unwrap_or_default()
            }
            Err(_) => {
                warn!(
                    "Merged tile {coord} exceeded {:?}; serving black tile",
                    self.merged_timeout
                );
                black_rgb_png().unwrap_or_default()
            }
        }
    }

    /// Queue tiles for background fetching; returns the accepted count.
    pub fn prefetch(&self, coords: Vec<TileCoord>, priority: i32) -> usize {
        coords
            .into_iter()
            .filter(|coord| self.scheduler.submit(coord.clone(), priority))
            .count()
    }

    /// Probe one known archive end to end.
    ///
    /// Opens the configured probe archive and reads chunk `(0, 0, 0)` under
    /// the health deadline, via the assembler's fallible path: failures
    /// surface structurally instead of degrading to a zero tile, while a
    /// healthy probe is cached so repeated checks stay off the network.
    pub async fn health(&self) -> HealthReport {
        let outcome = timeout(self.health_timeout, self.assembler.try_tile(&self.probe)).await;

        let detail = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "health probe exceeded {}s",
                self.health_timeout.as_secs()
            )),
        };

        let stats = self.cache.stats();
        HealthReport {
            status: if detail.is_none() { "ok" } else { "error" },
            detail,
            cache_bytes: stats.bytes,
            cache_entries: stats.entries,
            cache_hits: stats.hits,
            cache_misses: stats.misses,
            queue_depth: self.scheduler.queue_depth(),
            open_archives: self.store.open_count(),
        }
    }
}

/// Shared application state for the HTTP facade.
#[derive(Clone)]
pub struct AppState {
    service: Arc<TileService>,
}

impl AppState {
    /// Build the full component stack from configuration.
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let op_timeout = Duration::from_secs(config.op_timeout_secs);
        let provider: Arc<dyn SignedUrlProvider> =
            Arc::new(HttpSignedUrlProvider::new(&config.metadata_base, op_timeout)?);
        Self::with_provider(config, provider)
    }

    /// Build the component stack around a caller-supplied collaborator.
    ///
    /// Tests inject stub providers here; production uses [`AppState::new`].
    pub fn with_provider(
        config: &ServerConfig,
        provider: Arc<dyn SignedUrlProvider>,
    ) -> Result<Self, ServerError> {
        let op_timeout = Duration::from_secs(config.op_timeout_secs);
        let transport = Arc::new(RangeTransport::with_op_timeout(op_timeout)?);
        let registry = Arc::new(UrlRegistry::with_safety_margin(
            Arc::clone(&provider),
            config.safety_margin_secs,
        ));
        let direct = DirectChunkReader::new(Arc::clone(&provider), Arc::clone(&transport));
        let store = Arc::new(ChunkStore::with_safety_margin(
            registry,
            transport,
            direct,
            config.safety_margin_secs,
        ));
        let cache = Arc::new(ChunkCache::with_max_bytes(config.cache_bytes));
        let assembler = Arc::new(TileAssembler::new(Arc::clone(&store), Arc::clone(&cache)));
        let scheduler = Arc::new(TileScheduler::with_workers(config.effective_workers()));

        let service = Arc::new(TileService::new(
            Arc::clone(&assembler),
            store,
            Arc::clone(&scheduler),
            cache,
            config,
        ));

        // Workers resolve queued jobs through the same assembler the
        // synchronous path uses, so either side can win the coalesced fetch.
        scheduler.spawn_workers(assembler);

        Ok(Self { service })
    }

    /// The tile service.
    pub fn service(&self) -> &Arc<TileService> {
        &self.service
    }
}

/// Build the state and run the HTTP server until shutdown.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let state = AppState::new(&config)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|source| ServerError::BindFailed { addr: config.bind, source })?;

    info!("Tile server listening on {}", config.bind);

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Shutdown(format!("HTTP server error: {e}")))?;

    Ok(())
}
