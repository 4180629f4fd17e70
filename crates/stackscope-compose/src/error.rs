//! Error types for the composition pipeline.

use thiserror::Error;

/// Error types for channel composition.
#[derive(Error, Debug)]
pub enum Error {
    /// An input plane is not a full tile
    #[error("Plane has {actual} bytes, expected {expected}")]
    PlaneSize {
        /// Expected plane size in bytes
        expected: usize,
        /// Actual plane size in bytes
        actual: usize,
    },

    /// More channels than one tile can compose
    #[error("Cannot compose {count} channels (limit {limit})")]
    TooManyChannels {
        /// Requested channel count
        count: usize,
        /// Maximum supported
        limit: usize,
    },

    /// A settings value is outside its documented range
    #[error("Invalid {field} value {value}")]
    InvalidSetting {
        /// Field name
        field: &'static str,
        /// Offending value, rendered
        value: String,
    },

    /// PNG encoding failed
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Result type for composition operations.
pub type Result<T> = std::result::Result<T, Error>;
