//! Channel composition and PNG encoding.
//!
//! Single-channel tiles encode as grayscale PNGs. Merged tiles compose up to
//! five channels into RGB: the brightfield base renders as stacked gray, and
//! each fluorescence overlay is tinted with its channel color, then
//! screen-blended over the base (`1 - (1-a)(1-b)`), or combined with a
//! per-pixel maximum when no base is present.

use image::{ImageBuffer, Luma, Rgb};
use std::io::Cursor;
use tracing::trace;

use stackscope_store::ChannelId;
use stackscope_store::types::{TILE_BYTES, TILE_SIZE};

use crate::adjust::adjust_plane;
use crate::error::{Error, Result};
use crate::settings::SettingsMap;

/// Maximum number of channels one merged tile may compose.
pub const MAX_CHANNELS: usize = 5;

fn check_plane(plane: &[u8]) -> Result<()> {
    if plane.len() != TILE_BYTES {
        return Err(Error::PlaneSize { expected: TILE_BYTES, actual: plane.len() });
    }
    Ok(())
}

/// Encode a grayscale plane as PNG bytes.
pub fn encode_gray_png(plane: &[u8]) -> Result<Vec<u8>> {
    check_plane(plane)?;
    let image: ImageBuffer<Luma<u8>, _> =
        ImageBuffer::from_raw(TILE_SIZE as u32, TILE_SIZE as u32, plane.to_vec())
            .ok_or(Error::PlaneSize { expected: TILE_BYTES, actual: plane.len() })?;
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Encode an interleaved RGB buffer as PNG bytes.
pub fn encode_rgb_png(rgb: &[u8]) -> Result<Vec<u8>> {
    if rgb.len() != TILE_BYTES * 3 {
        return Err(Error::PlaneSize { expected: TILE_BYTES * 3, actual: rgb.len() });
    }
    let image: ImageBuffer<Rgb<u8>, _> =
        ImageBuffer::from_raw(TILE_SIZE as u32, TILE_SIZE as u32, rgb.to_vec())
            .ok_or(Error::PlaneSize { expected: TILE_BYTES * 3, actual: rgb.len() })?;
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// A black 256x256 RGB PNG, for requests with no data at all.
pub fn black_rgb_png() -> Result<Vec<u8>> {
    encode_rgb_png(&vec![0u8; TILE_BYTES * 3])
}

/// A black 256x256 grayscale PNG.
pub fn black_gray_png() -> Result<Vec<u8>> {
    encode_gray_png(&vec![0u8; TILE_BYTES])
}

/// Compose one channel into a grayscale PNG.
///
/// With all-default settings the source plane is encoded as-is, which keeps
/// this path bit-identical to the stored chunk.
pub fn compose_single(
    plane: &[u8],
    channel: ChannelId,
    settings: &SettingsMap,
) -> Result<Vec<u8>> {
    check_plane(plane)?;
    let channel_settings = settings.get(channel);
    channel_settings.validate()?;

    if channel_settings.is_default() {
        trace!("Default settings for {channel}, encoding raw plane");
        return encode_gray_png(plane);
    }

    let adjusted = adjust_plane(plane, &channel_settings);
    encode_gray_png(&adjusted)
}

/// Compose up to five channels into one RGB PNG.
///
/// Layers compose in channel-key order so the output is independent of the
/// order the caller listed them in. An empty input yields the black tile.
pub fn compose_merged(
    layers: &[(ChannelId, &[u8])],
    settings: &SettingsMap,
) -> Result<Vec<u8>> {
    if layers.is_empty() {
        return black_rgb_png();
    }
    if layers.len() > MAX_CHANNELS {
        return Err(Error::TooManyChannels { count: layers.len(), limit: MAX_CHANNELS });
    }
    for (_, plane) in layers {
        check_plane(plane)?;
    }
    settings.validate()?;

    let mut ordered: Vec<(ChannelId, &[u8])> = layers.to_vec();
    ordered.sort_by_key(|(channel, _)| channel.key());

    // Fast path: with every channel at defaults the raw bytes compose
    // directly, skipping the per-channel adjustment stage entirely.
    let channels: Vec<ChannelId> = ordered.iter().map(|(c, _)| *c).collect();
    let fast = settings.all_default(&channels);

    let mut out = vec![0u8; TILE_BYTES * 3];
    let mut adjusted: Vec<(bool, [f32; 3], Vec<u8>)> = Vec::with_capacity(ordered.len());
    for (channel, plane) in &ordered {
        let plane = if fast {
            plane.to_vec()
        } else {
            adjust_plane(plane, &settings.get(*channel))
        };
        let tint = settings
            .get(*channel)
            .color_for(*channel)
            .unwrap_or([255, 255, 255])
            .map(|c| f32::from(c) / 255.0);
        adjusted.push((channel.is_brightfield(), tint, plane));
    }

    let has_base = adjusted.first().is_some_and(|(is_base, ..)| *is_base);

    for pixel in 0..TILE_BYTES {
        let mut rgb = [0.0f32; 3];
        for (is_base, tint, plane) in &adjusted {
            let value = f32::from(plane[pixel]) / 255.0;
            if *is_base {
                rgb = [value, value, value];
                continue;
            }
            for (slot, tint) in rgb.iter_mut().zip(tint.iter()) {
                let layer = value * tint;
                *slot = if has_base {
                    // Screen blend keeps the base visible under overlays.
                    1.0 - (1.0 - *slot) * (1.0 - layer)
                } else {
                    slot.max(layer)
                };
            }
        }
        for (offset, &component) in rgb.iter().enumerate() {
            out[pixel * 3 + offset] = (component * 255.0).clamp(0.0, 255.0).round() as u8;
        }
    }

    encode_rgb_png(&out)
}
