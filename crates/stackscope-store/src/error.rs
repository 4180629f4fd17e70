//! Error types for tile access operations.

use std::sync::Arc;
use thiserror::Error;

/// Error types for the tile access core.
#[derive(Error, Debug)]
pub enum Error {
    /// The artifact-metadata collaborator refused or failed to vend a URL
    #[error("Signed URL unavailable for {dataset}/{path}: {reason}")]
    UrlUnavailable {
        /// Dataset the URL was requested for
        dataset: String,
        /// Member path within the dataset
        path: String,
        /// Collaborator-reported reason
        reason: String,
    },

    /// HTTP request failed at the transport level
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The archive host rejected the signed URL (expired or bad signature)
    #[error("Signed URL rejected with status {status}")]
    ExpiredSignature {
        /// HTTP status returned by the archive host
        status: u16,
    },

    /// The archive object does not exist at the signed URL
    #[error("Archive object not found at signed URL")]
    ArchiveNotFound,

    /// Unexpected status for a ranged read
    #[error("Range request returned status {status} (offset {offset}, {len} bytes)")]
    RangeStatus {
        /// HTTP status returned
        status: u16,
        /// Requested byte offset
        offset: u64,
        /// Requested length
        len: u64,
    },

    /// A response was missing or malformed where bytes were expected
    #[error("Invalid response from archive host: {0}")]
    InvalidResponse(String),

    /// A network operation exceeded its deadline
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// Container or codec parsing failed
    #[error("Archive format error: {0}")]
    Format(#[from] stackscope_formats::Error),

    /// The coalesced leader for this key dropped before broadcasting a result
    #[error("Coalesced request interrupted before completion")]
    CoalesceInterrupted,
}

/// Result type for tile access operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result shared between coalesced waiters.
///
/// Errors crossing a single-flight boundary are reference-counted so every
/// waiter observes the same failure.
pub type SharedResult<T> = std::result::Result<T, Arc<Error>>;

impl Error {
    /// Create an invalid-response error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse(reason.into())
    }

    /// Create a URL-unavailable error.
    pub fn url_unavailable(
        dataset: impl Into<String>,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UrlUnavailable {
            dataset: dataset.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether refreshing the signed URL and retrying once is worthwhile.
    ///
    /// True for expired signatures and transport-level failures; false for
    /// decode errors, absent objects and collaborator refusals, where a fresh
    /// URL changes nothing.
    pub fn needs_url_refresh(&self) -> bool {
        match self {
            Self::ExpiredSignature { .. }
            | Self::Http(_)
            | Self::Timeout { .. }
            | Self::InvalidResponse(_) => true,
            Self::RangeStatus { status, .. } => *status >= 500,
            Self::UrlUnavailable { .. }
            | Self::ArchiveNotFound
            | Self::Format(_)
            | Self::CoalesceInterrupted => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_classification() {
        assert!(Error::ExpiredSignature { status: 403 }.needs_url_refresh());
        assert!(Error::Timeout { duration_ms: 50_000 }.needs_url_refresh());
        assert!(
            Error::RangeStatus { status: 503, offset: 0, len: 16 }.needs_url_refresh()
        );
        assert!(
            !Error::RangeStatus { status: 416, offset: 0, len: 16 }.needs_url_refresh()
        );
        assert!(!Error::ArchiveNotFound.needs_url_refresh());
        assert!(
            !Error::Format(stackscope_formats::Error::decode("bad frame"))
                .needs_url_refresh()
        );
    }
}
