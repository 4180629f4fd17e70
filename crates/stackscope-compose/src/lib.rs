//! Channel adjustment and composition for microscopy tiles.
//!
//! Takes the grayscale chunk planes the tile access core produces and turns
//! them into the PNG the viewer receives. Up to five channels compose into
//! one RGB tile: the brightfield base renders as grayscale, fluorescence
//! overlays are tinted with their channel color and screen-blended on top.
//!
//! Per-channel adjustments run in a fixed order: linear brightness, then
//! percentile intensity rescale, then CLAHE. When every requested channel is
//! at default settings the pipeline short-circuits and composes from the raw
//! bytes, which keeps the brightfield-only case bit-identical to the source
//! plane.

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adjust;
pub mod compose;
pub mod error;
pub mod settings;

pub use compose::{compose_merged, compose_single, encode_gray_png, encode_rgb_png};
pub use error::{Error, Result};
pub use settings::{ChannelSettings, SettingsMap};
