//! Error types for server startup and runtime.

use thiserror::Error;

/// Server construction and runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration value failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A core component failed to initialize
    #[error("Component initialization failed: {0}")]
    Init(#[from] stackscope_store::Error),

    /// Failed to bind the HTTP listener
    #[error("Failed to bind HTTP server to {addr}: {source}")]
    BindFailed {
        /// Address that failed to bind
        addr: std::net::SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server exited abnormally
    #[error("Server shut down: {0}")]
    Shutdown(String),
}
