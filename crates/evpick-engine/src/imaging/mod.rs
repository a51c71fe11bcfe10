mod matcher;

use std::path::Path;

use anyhow::{Context, Result};
use evpick_contracts::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

pub use matcher::{PortraitMatcher, PreparedRegion};

const PHASH_SIDE: u32 = 32;
const PHASH_LOW: usize = 8;

/// 64-bit perceptual hash: 32x32 grayscale, 2-D DCT-II, top-left 8x8
/// coefficients compared against their median. The first coefficient is the
/// most significant bit.
pub fn phash64(image: &DynamicImage) -> u64 {
    let resized = image
        .grayscale()
        .resize_exact(PHASH_SIDE, PHASH_SIDE, FilterType::Lanczos3)
        .to_luma8();
    phash_gray(&resized)
}

pub fn phash_rgb(image: &RgbImage) -> u64 {
    phash64(&DynamicImage::ImageRgb8(image.clone()))
}

pub fn phash_file(path: &Path) -> Result<u64> {
    let image = image::open(path)
        .with_context(|| format!("failed to read image for phash ({})", path.display()))?;
    Ok(phash64(&image))
}

fn phash_gray(resized: &GrayImage) -> u64 {
    let n = PHASH_SIDE as usize;
    let basis: Vec<Vec<f64>> = (0..PHASH_LOW)
        .map(|k| {
            (0..n)
                .map(|i| {
                    (std::f64::consts::PI * k as f64 * (2 * i + 1) as f64 / (2 * n) as f64).cos()
                })
                .collect()
        })
        .collect();

    // rows first, keeping only the low frequencies
    let mut rows = vec![[0.0f64; PHASH_LOW]; n];
    for (y, row) in rows.iter_mut().enumerate() {
        for (k, coeff) in row.iter_mut().enumerate() {
            *coeff = (0..n)
                .map(|x| f64::from(resized.get_pixel(x as u32, y as u32)[0]) * basis[k][x])
                .sum();
        }
    }

    let mut low = [0.0f64; PHASH_LOW * PHASH_LOW];
    for v in 0..PHASH_LOW {
        for u in 0..PHASH_LOW {
            low[v * PHASH_LOW + u] = (0..n).map(|y| rows[y][u] * basis[v][y]).sum();
        }
    }

    let mut sorted = low;
    sorted.sort_by(f64::total_cmp);
    let median = (sorted[31] + sorted[32]) / 2.0;

    low.iter()
        .fold(0u64, |acc, coeff| (acc << 1) | u64::from(*coeff > median))
}

/// Hamming similarity of two 64-bit hashes in `[0, 1]`.
pub fn hash_similarity(left: u64, right: u64) -> f64 {
    let distance = f64::from((left ^ right).count_ones());
    (1.0 - distance / 64.0).clamp(0.0, 1.0)
}

/// Mean of several hashes, taken as integers.
pub fn mean_hash(hashes: &[u64]) -> Option<u64> {
    if hashes.is_empty() {
        return None;
    }
    let sum: u128 = hashes.iter().map(|hash| u128::from(*hash)).sum();
    u64::try_from(sum / hashes.len() as u128).ok()
}

/// Clamps a float box onto integer pixel bounds, keeping it at least one
/// pixel wide and tall. `None` for an empty frame.
pub fn clamp_box(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x1 = bbox.x1.clamp(0.0, max_x) as u32;
    let y1 = bbox.y1.clamp(0.0, max_y) as u32;
    let mut x2 = bbox.x2.clamp(0.0, max_x) as u32;
    let mut y2 = bbox.y2.clamp(0.0, max_y) as u32;
    if x2 <= x1 {
        x2 = (x1 + 1).min(width - 1);
    }
    if y2 <= y1 {
        y2 = (y1 + 1).min(height - 1);
    }
    Some((x1, y1, x2, y2))
}

pub fn crop(frame: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    match clamp_box(bbox, frame.width(), frame.height()) {
        Some((x1, y1, x2, y2)) => {
            image::imageops::crop_imm(frame, x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
                .to_image()
        }
        None => RgbImage::new(0, 0),
    }
}

/// RGB to HSV on the 8-bit OpenCV scale: H in `0..180`, S and V in `0..=255`.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (f64::from(r), f64::from(g), f64::from(b));
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = v - min;
    let s = if v > 0.0 { delta * 255.0 / v } else { 0.0 };
    let mut h = if delta == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / delta
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }
    let h = (h / 2.0).round() as u32 % 180;
    (h as u8, s.round().min(255.0) as u8, v as u8)
}

/// Scales each channel so the channel means agree.
pub fn gray_world(image: &RgbImage) -> RgbImage {
    let pixels = u64::from(image.width()) * u64::from(image.height());
    if pixels == 0 {
        return image.clone();
    }
    let mut sums = [0.0f64; 3];
    for pixel in image.pixels() {
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += f64::from(channel);
        }
    }
    let means = sums.map(|sum| sum / pixels as f64 + 1e-6);
    let target = (means[0] + means[1] + means[2]) / 3.0;
    let scale = means.map(|mean| target / mean);

    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for (channel, factor) in pixel.0.iter_mut().zip(scale) {
            *channel = (f64::from(*channel) * factor).clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        })
    }

    fn blocks(seed: u32) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            let (bx, by) = (x / 8, y / 8);
            let value = ((bx * 7 + by * 13 + seed) * 37 % 251) as u8;
            Rgb([value, value / 2, 255 - value])
        })
    }

    #[test]
    fn phash_is_stable_under_resizing() {
        let small = blocks(0);
        let large = image::imageops::resize(&small, 160, 160, FilterType::Triangle);
        let a = phash_rgb(&small);
        let b = phash_rgb(&large);
        assert!(hash_similarity(a, b) > 0.85, "{a:016x} vs {b:016x}");

        let other = phash_rgb(&blocks(5));
        assert!(hash_similarity(a, other) < hash_similarity(a, b));
    }

    #[test]
    fn hash_similarity_counts_bits() {
        assert_eq!(hash_similarity(0, 0), 1.0);
        assert_eq!(hash_similarity(0, u64::MAX), 0.0);
        assert_eq!(hash_similarity(0, 0xFFFF_FFFF), 0.5);
        assert_eq!(mean_hash(&[u64::MAX, u64::MAX - 2]), Some(u64::MAX - 1));
        assert_eq!(mean_hash(&[]), None);
    }

    #[test]
    fn hsv_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        assert_eq!(rgb_to_hsv(0, 255, 0), (60, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        assert_eq!(rgb_to_hsv(40, 40, 40), (0, 0, 40));
        let (h, s, v) = rgb_to_hsv(30, 110, 230);
        assert!((100..=110).contains(&h), "{h}");
        assert!(s > 80 && v > 100);
    }

    #[test]
    fn crop_clamps_to_frame() {
        let frame = gradient(100, 50);
        let inside = crop(&frame, &BoundingBox::new(10.0, 10.0, 30.0, 20.0));
        assert_eq!(inside.dimensions(), (20, 10));
        let outside = crop(&frame, &BoundingBox::new(-20.0, 40.0, 500.0, 40.0));
        assert_eq!(outside.dimensions(), (99, 1));
        assert_eq!(crop(&RgbImage::new(0, 0), &BoundingBox::new(0.0, 0.0, 5.0, 5.0)).dimensions(), (0, 0));
    }

    #[test]
    fn gray_world_equalizes_channel_means() {
        let tinted = RgbImage::from_pixel(4, 4, Rgb([200, 100, 50]));
        let balanced = gray_world(&tinted);
        let pixel = balanced.get_pixel(0, 0);
        assert!((i32::from(pixel[0]) - i32::from(pixel[1])).abs() <= 1);
        assert!((i32::from(pixel[1]) - i32::from(pixel[2])).abs() <= 1);
    }
}
