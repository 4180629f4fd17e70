//! Core identifier types for tiles, archives and leases.

use std::fmt;

/// Side length of a served tile in pixels; equal to the archive chunk size.
pub const TILE_SIZE: usize = stackscope_formats::CHUNK_DIM;

/// Byte size of one tile plane.
pub const TILE_BYTES: usize = stackscope_formats::CHUNK_BYTES;

/// Default byte-cache capacity (256 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// Default safety margin before lease expiry triggers a refresh, in seconds.
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 300;

/// Lease lifetime assumed when a signed URL carries no expiry parameters.
pub const DEFAULT_LEASE_SECS: u64 = 3600;

/// Highest scale level a request may name.
pub const MAX_SCALE: u8 = 10;

/// Acquisition channel, identified by its fixed integer key.
///
/// Channel 0 is the brightfield base; the others are fluorescence overlays
/// named by excitation wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    /// Key 0: full brightfield LED matrix
    BrightField,
    /// Key 11: 405 nm excitation
    Fluor405,
    /// Key 12: 488 nm excitation
    Fluor488,
    /// Key 13: 638 nm excitation
    Fluor638,
    /// Key 14: 561 nm excitation
    Fluor561,
}

impl ChannelId {
    /// All channels, brightfield first.
    pub const ALL: [Self; 5] = [
        Self::BrightField,
        Self::Fluor405,
        Self::Fluor488,
        Self::Fluor638,
        Self::Fluor561,
    ];

    /// Resolve a channel from its integer key.
    pub fn from_key(key: u8) -> Option<Self> {
        match key {
            0 => Some(Self::BrightField),
            11 => Some(Self::Fluor405),
            12 => Some(Self::Fluor488),
            13 => Some(Self::Fluor638),
            14 => Some(Self::Fluor561),
            _ => None,
        }
    }

    /// The channel's integer key.
    pub fn key(self) -> u8 {
        match self {
            Self::BrightField => 0,
            Self::Fluor405 => 11,
            Self::Fluor488 => 12,
            Self::Fluor638 => 13,
            Self::Fluor561 => 14,
        }
    }

    /// The channel's archive name, used in archive member paths.
    pub fn name(self) -> &'static str {
        match self {
            Self::BrightField => "BF_LED_matrix_full",
            Self::Fluor405 => "Fluorescence_405_nm_Ex",
            Self::Fluor488 => "Fluorescence_488_nm_Ex",
            Self::Fluor638 => "Fluorescence_638_nm_Ex",
            Self::Fluor561 => "Fluorescence_561_nm_Ex",
        }
    }

    /// Resolve a channel from its archive name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Whether this is the brightfield base channel.
    pub fn is_brightfield(self) -> bool {
        self == Self::BrightField
    }

    /// Default overlay color for fluorescence channels.
    ///
    /// Brightfield has no tint; it renders as the grayscale base.
    pub fn default_color(self) -> Option<[u8; 3]> {
        match self {
            Self::BrightField => None,
            Self::Fluor405 => Some([153, 85, 255]),
            Self::Fluor488 => Some([34, 255, 34]),
            Self::Fluor638 => Some([255, 0, 0]),
            Self::Fluor561 => Some([255, 85, 85]),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of one remote archive: a `(dataset, timestamp, channel)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey {
    /// Dataset identifier (workspace-qualified artifact alias)
    pub dataset: String,
    /// Timestamp folder name
    pub timestamp: String,
    /// Acquisition channel
    pub channel: ChannelId,
}

impl ArchiveKey {
    /// Dataset-relative path of the archive member holding this channel.
    pub fn member_path(&self) -> String {
        format!("{}/{}.zip", self.timestamp, self.channel.name())
    }

    /// Dataset-relative path of one chunk in the legacy unpacked layout.
    pub fn direct_chunk_path(&self, scale: u8, y: u32, x: u32) -> String {
        format!(
            "{}/{}/scale{}/{}.{}",
            self.timestamp,
            self.channel.name(),
            scale,
            y,
            x
        )
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dataset, self.timestamp, self.channel)
    }
}

/// Identity of one 256x256 tile (and of its backing chunk).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCoord {
    /// Dataset identifier
    pub dataset: String,
    /// Timestamp folder name
    pub timestamp: String,
    /// Acquisition channel
    pub channel: ChannelId,
    /// Scale level; 0 is full resolution
    pub scale: u8,
    /// Column index in chunk units
    pub x: u32,
    /// Row index in chunk units
    pub y: u32,
}

impl TileCoord {
    /// The archive this tile's chunk lives in.
    pub fn archive_key(&self) -> ArchiveKey {
        ArchiveKey {
            dataset: self.dataset.clone(),
            timestamp: self.timestamp.clone(),
            channel: self.channel,
        }
    }

    /// Same coordinate on a different channel.
    pub fn with_channel(&self, channel: ChannelId) -> Self {
        Self { channel, ..self.clone() }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.dataset, self.timestamp, self.channel, self.scale, self.x, self.y
        )
    }
}

/// A signed URL together with its absolute expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLease {
    /// The signed URL
    pub url: String,
    /// Absolute expiry, seconds since the Unix epoch
    pub expires_at: u64,
}

impl UrlLease {
    /// Seconds of validity left at `now`.
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Whether the lease is still comfortably inside its validity window.
    pub fn is_fresh(&self, now: u64, safety_margin: u64) -> bool {
        self.remaining(now) >= safety_margin
    }
}
