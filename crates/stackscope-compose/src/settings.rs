//! Per-channel display settings.
//!
//! Every adjustment knob is an explicit optional field; `None` means "use the
//! registered default", which lets the pipeline distinguish an untouched
//! channel (fast path, no resampling of the source bytes) from one a user
//! explicitly set to the default-looking value.

use serde::Deserialize;
use std::collections::HashMap;

use stackscope_store::ChannelId;

use crate::error::{Error, Result};

/// Default CLAHE clip limit.
pub const DEFAULT_CONTRAST: f32 = 0.03;

/// Default linear brightness scale.
pub const DEFAULT_BRIGHTNESS: f32 = 1.0;

/// Default intensity-rescale percentile window.
pub const DEFAULT_THRESHOLD: (f32, f32) = (2.0, 98.0);

/// Display settings for one channel.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelSettings {
    /// CLAHE clip limit in `[0, 1]`
    pub contrast: Option<f32>,
    /// Linear brightness scale, positive
    pub brightness: Option<f32>,
    /// Intensity-rescale percentile window, each in `[0, 100]`
    pub threshold: Option<(f32, f32)>,
    /// Overlay color; fluorescence channels fall back to their registered color
    pub color: Option<[u8; 3]>,
}

impl ChannelSettings {
    /// Whether every knob is at its default.
    pub fn is_default(&self) -> bool {
        self.contrast.is_none()
            && self.brightness.is_none()
            && self.threshold.is_none()
            && self.color.is_none()
    }

    /// Whether the contrast/threshold adjustment stage applies.
    pub fn wants_adjustment(&self) -> bool {
        self.contrast.is_some() || self.threshold.is_some()
    }

    /// Effective CLAHE clip limit.
    pub fn contrast(&self) -> f32 {
        self.contrast.unwrap_or(DEFAULT_CONTRAST)
    }

    /// Effective brightness scale.
    pub fn brightness(&self) -> f32 {
        self.brightness.unwrap_or(DEFAULT_BRIGHTNESS)
    }

    /// Effective percentile window.
    pub fn threshold(&self) -> (f32, f32) {
        self.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Effective overlay color for `channel`.
    pub fn color_for(&self, channel: ChannelId) -> Option<[u8; 3]> {
        self.color.or_else(|| channel.default_color())
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<()> {
        if let Some(contrast) = self.contrast {
            if !(0.0..=1.0).contains(&contrast) {
                return Err(Error::InvalidSetting {
                    field: "contrast",
                    value: contrast.to_string(),
                });
            }
        }
        if let Some(brightness) = self.brightness {
            if brightness <= 0.0 || !brightness.is_finite() {
                return Err(Error::InvalidSetting {
                    field: "brightness",
                    value: brightness.to_string(),
                });
            }
        }
        if let Some((lo, hi)) = self.threshold {
            let in_range = (0.0..=100.0).contains(&lo) && (0.0..=100.0).contains(&hi);
            if !in_range || lo >= hi {
                return Err(Error::InvalidSetting {
                    field: "threshold",
                    value: format!("({lo}, {hi})"),
                });
            }
        }
        Ok(())
    }
}

/// Settings for a set of channels, with default fallback.
///
/// Missing channels read as all-default settings; requests never fail on an
/// absent key.
#[derive(Debug, Clone, Default)]
pub struct SettingsMap {
    map: HashMap<ChannelId, ChannelSettings>,
}

impl SettingsMap {
    /// Create an empty (all-default) map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one channel's settings.
    pub fn insert(&mut self, channel: ChannelId, settings: ChannelSettings) {
        self.map.insert(channel, settings);
    }

    /// Settings for `channel`, falling back to defaults.
    pub fn get(&self, channel: ChannelId) -> ChannelSettings {
        self.map.get(&channel).cloned().unwrap_or_default()
    }

    /// Whether every channel in `channels` is at default settings.
    pub fn all_default(&self, channels: &[ChannelId]) -> bool {
        channels.iter().all(|c| self.get(*c).is_default())
    }

    /// Validate every stored entry.
    pub fn validate(&self) -> Result<()> {
        for settings in self.map.values() {
            settings.validate()?;
        }
        Ok(())
    }
}
