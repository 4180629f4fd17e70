//! Stackscope tile server binary entry point.
//!
//! A thin wrapper around the stackscope-server library that parses CLI
//! arguments, initializes logging and runs the server. For library usage see
//! the crate documentation.

use anyhow::Result;
use stackscope_server::{ServerConfig, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_args();
    config.validate()?;

    tracing::info!(
        "Starting tile server: bind={}, metadata={}, cache={} bytes, workers={}",
        config.bind,
        config.metadata_base,
        config.cache_bytes,
        config.effective_workers()
    );

    serve(config).await?;
    Ok(())
}
