//! Error types for container and codec parsing.

use thiserror::Error;

/// Error types for parsing and decoding operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input ended before a complete record could be read
    #[error("Truncated input: needed {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the record being parsed
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// A record signature did not match
    #[error("Invalid {record} signature: {found:#010x}")]
    InvalidSignature {
        /// Record kind being parsed
        record: &'static str,
        /// Signature value found in the input
        found: u32,
    },

    /// ZIP member uses a compression method this reader does not handle
    #[error("Unsupported ZIP compression method {method} for member {name}")]
    UnsupportedMethod {
        /// ZIP method id (0 = store, 8 = deflate)
        method: u16,
        /// Member name
        name: String,
    },

    /// Chunk codec is not one this decoder handles
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Codec produced an error or inconsistent output
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Array metadata was not valid JSON
    #[error("Invalid array metadata: {0}")]
    MetadataJson(#[from] serde_json::Error),

    /// Array metadata declares a dtype other than unsigned 8-bit
    #[error("Unsupported dtype {dtype}: arrays must be |u1")]
    UnsupportedDtype {
        /// dtype string from the metadata
        dtype: String,
    },

    /// Array metadata declares a memory order other than C
    #[error("Unsupported array order {order}: arrays must be C-ordered")]
    UnsupportedOrder {
        /// order string from the metadata
        order: String,
    },

    /// IO error from a streaming decoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for parsing and decoding operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a truncated-input error.
    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::Truncated { expected, actual }
    }

    /// Create a decode-failed error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode(reason.into())
    }

    /// Create an unsupported-codec error.
    pub fn unsupported_codec(codec: impl Into<String>) -> Self {
        Self::UnsupportedCodec(codec.into())
    }
}
