//! Server configuration.
//!
//! All runtime knobs arrive as CLI flags with environment-variable fallbacks
//! (`STACKSCOPE_*`); the core itself reads no environment and keeps no
//! persisted state, so a test can construct a [`ServerConfig`] literal and a
//! deployment can drive everything from flags.

use clap::Parser;
use std::net::SocketAddr;

use crate::error::ServerError;

/// Server configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stackscoped",
    about = "Read-only tile server for remote microscopy image stacks",
    version
)]
pub struct ServerConfig {
    /// HTTP bind address
    #[arg(long, env = "STACKSCOPE_BIND", default_value = "0.0.0.0:9040")]
    pub bind: SocketAddr,

    /// Base URL of the artifact-metadata service that vends signed URLs
    #[arg(
        long,
        env = "STACKSCOPE_METADATA_BASE",
        default_value = "https://hypha.aicell.io/agent-lens/artifacts"
    )]
    pub metadata_base: String,

    /// Byte budget for the decoded-chunk cache
    #[arg(long, env = "STACKSCOPE_CACHE_BYTES", default_value_t = 268_435_456)]
    pub cache_bytes: usize,

    /// Tile worker count; 0 selects min(16, 2 x logical CPUs)
    #[arg(long, env = "STACKSCOPE_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Seconds of lease validity required before a signed URL is reused
    #[arg(long, env = "STACKSCOPE_SAFETY_MARGIN_SECS", default_value_t = 300)]
    pub safety_margin_secs: u64,

    /// Deadline for one network operation, in seconds
    #[arg(long, env = "STACKSCOPE_OP_TIMEOUT_SECS", default_value_t = 50)]
    pub op_timeout_secs: u64,

    /// Deadline for one tile request, in seconds
    #[arg(long, env = "STACKSCOPE_TILE_TIMEOUT_SECS", default_value_t = 60)]
    pub tile_timeout_secs: u64,

    /// Deadline for one merged-tile request, in seconds
    #[arg(long, env = "STACKSCOPE_MERGED_TIMEOUT_SECS", default_value_t = 120)]
    pub merged_timeout_secs: u64,

    /// Deadline for the health probe, in seconds
    #[arg(long, env = "STACKSCOPE_HEALTH_TIMEOUT_SECS", default_value_t = 50)]
    pub health_timeout_secs: u64,

    /// Timestamp substituted when a request omits one
    #[arg(
        long,
        env = "STACKSCOPE_DEFAULT_TIMESTAMP",
        default_value = "2025-04-29_16-38-27"
    )]
    pub default_timestamp: String,

    /// Dataset the health probe opens
    #[arg(
        long,
        env = "STACKSCOPE_PROBE_DATASET",
        default_value = "agent-lens/image-map-20250429-treatment-zip"
    )]
    pub probe_dataset: String,

    /// Timestamp the health probe opens; defaults to the default timestamp
    #[arg(long, env = "STACKSCOPE_PROBE_TIMESTAMP")]
    pub probe_timestamp: Option<String>,
}

impl ServerConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Validate value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.cache_bytes < stackscope_store::types::TILE_BYTES {
            return Err(ServerError::InvalidConfig(format!(
                "cache-bytes {} cannot hold a single tile",
                self.cache_bytes
            )));
        }
        if self.metadata_base.is_empty() {
            return Err(ServerError::InvalidConfig(
                "metadata-base must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("op-timeout-secs", self.op_timeout_secs),
            ("tile-timeout-secs", self.tile_timeout_secs),
            ("merged-timeout-secs", self.merged_timeout_secs),
            ("health-timeout-secs", self.health_timeout_secs),
        ] {
            if value == 0 {
                return Err(ServerError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Worker count after resolving the automatic setting.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            stackscope_store::scheduler::default_worker_count()
        } else {
            self.workers
        }
    }

    /// Timestamp the health probe targets.
    pub fn probe_timestamp(&self) -> &str {
        self.probe_timestamp.as_deref().unwrap_or(&self.default_timestamp)
    }

    /// A configuration suitable for tests, pointed at `metadata_base`.
    pub fn for_tests(metadata_base: impl Into<String>) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            metadata_base: metadata_base.into(),
            cache_bytes: 64 * 1024 * 1024,
            workers: 2,
            safety_margin_secs: 300,
            op_timeout_secs: 10,
            tile_timeout_secs: 15,
            merged_timeout_secs: 20,
            health_timeout_secs: 10,
            default_timestamp: "2025-04-29_16-38-27".to_string(),
            probe_dataset: "agent-lens/image-map-test".to_string(),
            probe_timestamp: None,
        }
    }
}
