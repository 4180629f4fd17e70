//! Tile server for remote microscopy image stacks.
//!
//! Ties the tile access core and the composition pipeline behind a small
//! HTTP facade:
//!
//! - `GET /tile`: one channel as a 256x256 grayscale PNG
//! - `GET /merged-tile`: up to five channels composed into one RGB PNG
//! - `GET /prefetch`: queue tiles at low urgency, returns the accepted count
//! - `GET /health`: probe one known archive end to end
//!
//! Tile endpoints never fail outward: any internal error degrades to a black
//! tile so the viewer keeps its visual continuity. Health is the only
//! operation that surfaces errors.
//!
//! # Example
//!
//! ```no_run
//! use stackscope_server::{ServerConfig, serve};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ServerConfig::from_args();
//!     config.validate()?;
//!     serve(config).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod http;
pub mod service;

pub use config::ServerConfig;
pub use error::ServerError;
pub use http::create_router;
pub use service::{AppState, HealthReport, TileService, serve};
