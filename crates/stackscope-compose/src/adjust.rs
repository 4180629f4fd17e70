//! Per-channel intensity adjustments.
//!
//! The adjustment stage runs in a fixed order: linear brightness, percentile
//! intensity rescale, then contrast-limited adaptive histogram equalization.
//! All operations work on full tile planes of `u8` values.

use stackscope_store::TILE_SIZE;

use crate::settings::ChannelSettings;

/// CLAHE grid: 8x8 regions of 32x32 pixels over one tile.
const GRID: usize = 8;

/// Scale every value by `brightness`, clamping into `0..=255`.
pub fn apply_brightness(plane: &mut [u8], brightness: f32) {
    for value in plane.iter_mut() {
        *value = (f32::from(*value) * brightness).clamp(0.0, 255.0).round() as u8;
    }
}

/// Intensity values at the `lo` and `hi` percentiles.
///
/// Linear interpolation between order statistics, matching the numpy
/// convention the acquisition pipeline's tooling uses.
pub fn percentile_bounds(plane: &[u8], lo: f32, hi: f32) -> (f32, f32) {
    let mut hist = [0u32; 256];
    for &value in plane {
        hist[value as usize] += 1;
    }
    let n = plane.len();

    let nth = |k: usize| -> f32 {
        let mut cum = 0usize;
        for (value, &count) in hist.iter().enumerate() {
            cum += count as usize;
            if cum > k {
                return value as f32;
            }
        }
        255.0
    };

    let value_at = |p: f32| -> f32 {
        let pos = (p / 100.0) * (n - 1) as f32;
        let below = nth(pos.floor() as usize);
        let above = nth(pos.ceil() as usize);
        below + (above - below) * pos.fract()
    };

    (value_at(lo), value_at(hi))
}

/// Stretch `lo..hi` onto the full `0..255` range.
pub fn rescale_intensity(plane: &mut [u8], lo: f32, hi: f32) {
    if hi - lo < f32::EPSILON {
        // Degenerate window: threshold at the single bound.
        for value in plane.iter_mut() {
            *value = if f32::from(*value) > lo { 255 } else { 0 };
        }
        return;
    }
    let scale = 255.0 / (hi - lo);
    for value in plane.iter_mut() {
        *value = ((f32::from(*value) - lo) * scale).clamp(0.0, 255.0).round() as u8;
    }
}

/// Contrast-limited adaptive histogram equalization over a tile plane.
///
/// `clip_limit` is the clipped fraction of each region's pixel count; excess
/// mass is redistributed uniformly. Region lookup tables are blended with
/// bilinear interpolation so region seams do not show.
pub fn clahe(plane: &[u8], clip_limit: f32) -> Vec<u8> {
    let region = TILE_SIZE / GRID;
    let region_pixels = (region * region) as u32;
    let clip = ((clip_limit * region_pixels as f32).round() as u32).max(1);

    // One equalization LUT per grid region.
    let mut luts = vec![[0u8; 256]; GRID * GRID];
    for gy in 0..GRID {
        for gx in 0..GRID {
            let mut hist = [0u32; 256];
            for row in 0..region {
                let base = (gy * region + row) * TILE_SIZE + gx * region;
                for &value in &plane[base..base + region] {
                    hist[value as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for count in &mut hist {
                if *count > clip {
                    excess += *count - clip;
                    *count = clip;
                }
            }
            let bonus = excess / 256;
            let remainder = excess % 256;
            for (value, count) in hist.iter_mut().enumerate() {
                *count += bonus + u32::from((value as u32) < remainder);
            }

            let lut = &mut luts[gy * GRID + gx];
            let mut cum = 0u32;
            for (value, &count) in hist.iter().enumerate() {
                cum += count;
                lut[value] =
                    ((f64::from(cum) / f64::from(region_pixels)) * 255.0).round() as u8;
            }
        }
    }

    // Blend the four surrounding region LUTs per pixel.
    let mut out = vec![0u8; plane.len()];
    for y in 0..TILE_SIZE {
        let fy = (y as f32 + 0.5) / region as f32 - 0.5;
        let gy0 = (fy.floor().max(0.0) as usize).min(GRID - 1);
        let gy1 = (gy0 + 1).min(GRID - 1);
        let wy = (fy - fy.floor()).clamp(0.0, 1.0);
        let wy = if fy < 0.0 { 0.0 } else { wy };

        for x in 0..TILE_SIZE {
            let fx = (x as f32 + 0.5) / region as f32 - 0.5;
            let gx0 = (fx.floor().max(0.0) as usize).min(GRID - 1);
            let gx1 = (gx0 + 1).min(GRID - 1);
            let wx = (fx - fx.floor()).clamp(0.0, 1.0);
            let wx = if fx < 0.0 { 0.0 } else { wx };

            let value = plane[y * TILE_SIZE + x] as usize;
            let top = f32::from(luts[gy0 * GRID + gx0][value]) * (1.0 - wx)
                + f32::from(luts[gy0 * GRID + gx1][value]) * wx;
            let bottom = f32::from(luts[gy1 * GRID + gx0][value]) * (1.0 - wx)
                + f32::from(luts[gy1 * GRID + gx1][value]) * wx;
            out[y * TILE_SIZE + x] = (top * (1.0 - wy) + bottom * wy).round() as u8;
        }
    }
    out
}

/// Run the full adjustment pipeline for one channel.
///
/// Order is fixed: brightness, then (only when contrast or threshold were
/// explicitly set) percentile rescale followed by CLAHE.
pub fn adjust_plane(plane: &[u8], settings: &ChannelSettings) -> Vec<u8> {
    let mut out = plane.to_vec();

    let brightness = settings.brightness();
    if (brightness - 1.0).abs() > f32::EPSILON {
        apply_brightness(&mut out, brightness);
    }

    if settings.wants_adjustment() {
        let (p_lo, p_hi) = settings.threshold();
        let (lo, hi) = percentile_bounds(&out, p_lo, p_hi);
        rescale_intensity(&mut out, lo, hi);
        out = clahe(&out, settings.contrast());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stackscope_store::types::TILE_BYTES;

    #[test]
    fn test_brightness_scales_and_clamps() {
        let mut plane = vec![0u8, 50, 100, 200];
        apply_brightness(&mut plane, 1.5);
        assert_eq!(plane, vec![0, 75, 150, 255]);
    }

    #[test]
    fn test_percentiles_of_uniform_ramp() {
        let plane: Vec<u8> = (0..=255).collect();
        let (lo, hi) = percentile_bounds(&plane, 0.0, 100.0);
        assert_eq!((lo, hi), (0.0, 255.0));

        let (lo, hi) = percentile_bounds(&plane, 2.0, 98.0);
        assert!((lo - 5.1).abs() < 0.2, "lo was {lo}");
        assert!((hi - 249.9).abs() < 0.2, "hi was {hi}");
    }

    #[test]
    fn test_rescale_stretches_window() {
        let mut plane = vec![10u8, 50, 90, 130];
        rescale_intensity(&mut plane, 10.0, 130.0);
        assert_eq!(plane, vec![0, 85, 170, 255]);
    }

    #[test]
    fn test_rescale_degenerate_window_thresholds() {
        let mut plane = vec![10u8, 128, 200];
        rescale_intensity(&mut plane, 128.0, 128.0);
        assert_eq!(plane, vec![0, 0, 255]);
    }

    #[test]
    fn test_clahe_constant_plane_stays_constant() {
        let plane = vec![128u8; TILE_BYTES];
        let out = clahe(&plane, 0.03);
        assert_eq!(out.len(), TILE_BYTES);
        let first = out[0];
        assert!(out.iter().all(|&p| p == first));
    }

    #[test]
    fn test_clahe_is_deterministic() {
        let plane: Vec<u8> = (0..TILE_BYTES).map(|i| (i % 256) as u8).collect();
        assert_eq!(clahe(&plane, 0.03), clahe(&plane, 0.03));
    }

    #[test]
    fn test_default_settings_leave_plane_untouched() {
        let plane: Vec<u8> = (0..TILE_BYTES).map(|i| (i % 251) as u8).collect();
        let out = adjust_plane(&plane, &ChannelSettings::default());
        assert_eq!(out, plane);
    }

    #[test]
    fn test_explicit_threshold_runs_rescale_and_clahe() {
        let plane: Vec<u8> = (0..TILE_BYTES).map(|i| 100 + (i % 56) as u8).collect();
        let settings = ChannelSettings {
            threshold: Some((2.0, 98.0)),
            ..Default::default()
        };
        let out = adjust_plane(&plane, &settings);
        assert_eq!(out.len(), TILE_BYTES);
        // The narrow 100..=155 band stretches toward the full range.
        assert!(out.iter().any(|&p| p < 50));
        assert!(out.iter().any(|&p| p > 200));
    }
}
