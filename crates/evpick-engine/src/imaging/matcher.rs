use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use evpick_contracts::ScoreWeights;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use super::{gray_world, hash_similarity, phash_rgb, rgb_to_hsv};

const CANONICAL_SIDE: u32 = 48;
const HUE_BINS: usize = 32;
const SAT_BINS: usize = 32;

#[derive(Debug, Clone)]
struct Plane {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.pixels().map(|pixel| f32::from(pixel[0])).collect(),
        }
    }

    fn at(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    fn sobel(&self) -> Self {
        let mut data = vec![0.0f32; self.data.len()];
        if self.width >= 3 && self.height >= 3 {
            for y in 1..self.height - 1 {
                for x in 1..self.width - 1 {
                    let gx = self.at(x + 1, y - 1) + 2.0 * self.at(x + 1, y) + self.at(x + 1, y + 1)
                        - self.at(x - 1, y - 1)
                        - 2.0 * self.at(x - 1, y)
                        - self.at(x - 1, y + 1);
                    let gy = self.at(x - 1, y + 1) + 2.0 * self.at(x, y + 1) + self.at(x + 1, y + 1)
                        - self.at(x - 1, y - 1)
                        - 2.0 * self.at(x, y - 1)
                        - self.at(x + 1, y - 1);
                    data[(y * self.width + x) as usize] = (gx * gx + gy * gy).sqrt();
                }
            }
        }
        Self {
            width: self.width,
            height: self.height,
            data,
        }
    }

    fn stats(&self) -> (f64, f64) {
        let n = self.data.len().max(1) as f64;
        let mean = self.data.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
        let energy = self
            .data
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>();
        (mean, energy)
    }
}

/// Zero-mean normalised correlation of `small` against the window of `big`
/// starting at `(ox, oy)`, clamped at 0.
fn ncc_at(big: &Plane, small: &Plane, small_stats: (f64, f64), ox: u32, oy: u32) -> f64 {
    let (small_mean, small_energy) = small_stats;
    let n = f64::from(small.width * small.height);
    let mut sum = 0.0f64;
    for y in 0..small.height {
        for x in 0..small.width {
            sum += f64::from(big.at(ox + x, oy + y));
        }
    }
    let big_mean = sum / n;

    let mut cross = 0.0f64;
    let mut big_energy = 0.0f64;
    for y in 0..small.height {
        for x in 0..small.width {
            let a = f64::from(big.at(ox + x, oy + y)) - big_mean;
            let b = f64::from(small.at(x, y)) - small_mean;
            cross += a * b;
            big_energy += a * a;
        }
    }
    let denom = (big_energy * small_energy).sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (cross / denom).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
struct Scaled {
    gray: Plane,
    edges: Plane,
}

impl Scaled {
    fn new(gray: &GrayImage, side: u32) -> Self {
        let resized = imageops::resize(gray, side, side, FilterType::Triangle);
        let gray = Plane::from_gray(&resized);
        let edges = gray.sobel();
        Self { gray, edges }
    }
}

/// Query portrait prepared once per retrieval.
#[derive(Debug, Clone)]
pub struct PreparedRegion {
    scales: Vec<Scaled>,
    hash: u64,
    histogram: Option<Vec<f32>>,
}

#[derive(Debug)]
struct PreparedTemplate {
    canonical: Scaled,
    hash: u64,
    histogram: Option<Vec<f32>>,
}

/// Portrait similarity from multi-scale template correlation, perceptual
/// hash and a hair-focused hue/saturation histogram. Prepared templates are
/// cached per path for the matcher's lifetime.
#[derive(Debug)]
pub struct PortraitMatcher {
    template_weight: f64,
    hash_weight: f64,
    histogram_weight: f64,
    edge_weight: f64,
    scales: Vec<f64>,
    templates: Mutex<HashMap<PathBuf, Option<Arc<PreparedTemplate>>>>,
}

impl PortraitMatcher {
    pub fn new(weights: &ScoreWeights) -> Self {
        Self {
            template_weight: weights.cv_template,
            hash_weight: weights.cv_hash,
            histogram_weight: weights.cv_histogram,
            edge_weight: weights.template_edge,
            scales: weights.template_scales(),
            templates: Mutex::new(HashMap::new()),
        }
    }

    pub fn prepare_region(&self, portrait: &RgbImage) -> Option<PreparedRegion> {
        if portrait.width() < 2 || portrait.height() < 2 {
            return None;
        }
        let gray = imageops::grayscale(portrait);
        let scales = self
            .scales
            .iter()
            .map(|scale| {
                let side = (f64::from(CANONICAL_SIDE) * scale).round().max(3.0) as u32;
                Scaled::new(&gray, side)
            })
            .collect();
        Some(PreparedRegion {
            scales,
            hash: phash_rgb(portrait),
            histogram: portrait_histogram(portrait),
        })
    }

    pub fn cached_templates(&self) -> usize {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn template(&self, path: &Path) -> Option<Arc<PreparedTemplate>> {
        let mut cache = self.templates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = cache.get(path) {
            return entry.clone();
        }
        let prepared = match image::open(path) {
            Ok(image) => {
                let rgb = image.to_rgb8();
                let gray = imageops::grayscale(&rgb);
                Some(Arc::new(PreparedTemplate {
                    canonical: Scaled::new(&gray, CANONICAL_SIDE),
                    hash: phash_rgb(&rgb),
                    histogram: portrait_histogram(&rgb),
                }))
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "template unavailable");
                None
            }
        };
        cache.insert(path.to_path_buf(), prepared.clone());
        prepared
    }

    fn template_score(&self, region: &PreparedRegion, template: &PreparedTemplate) -> f64 {
        let tpl = &template.canonical;
        let mut best = 0.0f64;
        for scaled in &region.scales {
            let (big, small) = if scaled.gray.width >= tpl.gray.width {
                (scaled, tpl)
            } else {
                (tpl, scaled)
            };
            let gray_stats = small.gray.stats();
            let edge_stats = small.edges.stats();
            for oy in 0..=big.gray.height - small.gray.height {
                for ox in 0..=big.gray.width - small.gray.width {
                    let gray = ncc_at(&big.gray, &small.gray, gray_stats, ox, oy);
                    let edges = ncc_at(&big.edges, &small.edges, edge_stats, ox, oy);
                    let combined = (1.0 - self.edge_weight) * gray + self.edge_weight * edges;
                    best = best.max(combined);
                }
            }
        }
        best
    }

    /// Fused similarity in `[0, 1]`, `None` when the template cannot be read.
    pub fn similarity(&self, region: &PreparedRegion, template_path: &Path) -> Option<f64> {
        let template = self.template(template_path)?;
        let template_score = self.template_score(region, &template);
        let hash_score = hash_similarity(region.hash, template.hash);
        let histogram_score = match (&region.histogram, &template.histogram) {
            (Some(left), Some(right)) => bhattacharyya_similarity(left, right),
            _ => 0.0,
        };
        let fused = self.template_weight * template_score
            + self.hash_weight * hash_score
            + self.histogram_weight * histogram_score;
        Some(fused.clamp(0.0, 1.0))
    }

    /// Best similarity over several template variants.
    pub fn best_similarity<P: AsRef<Path>>(&self, region: &PreparedRegion, templates: &[P]) -> Option<f64> {
        templates
            .iter()
            .filter_map(|path| self.similarity(region, path.as_ref()))
            .reduce(f64::max)
    }
}

fn portrait_histogram(image: &RgbImage) -> Option<Vec<f32>> {
    let balanced = gray_world(image);
    let hsv: Vec<(u8, u8, u8)> = balanced
        .pixels()
        .map(|pixel| rgb_to_hsv(pixel[0], pixel[1], pixel[2]))
        .collect();
    let mask = hair_mask(&hsv, balanced.width(), balanced.height());
    hs_histogram(&hsv, Some(&mask)).or_else(|| hs_histogram(&hsv, None))
}

/// Chromatic, mid-brightness pixels in the upper part of the portrait,
/// cleaned with a 3x3 cross opening.
fn hair_mask(hsv: &[(u8, u8, u8)], width: u32, height: u32) -> Vec<bool> {
    let (w, h) = (width as usize, height as usize);
    let (y0, y1) = ((0.05 * h as f64) as usize, (0.60 * h as f64) as usize);
    let (x0, x1) = ((0.05 * w as f64) as usize, (0.95 * w as f64) as usize);

    let raw: Vec<bool> = hsv
        .iter()
        .enumerate()
        .map(|(idx, (_, s, v))| {
            let (x, y) = (idx % w, idx / w);
            *s >= 40 && (35..=235).contains(v) && (y0..y1).contains(&y) && (x0..x1).contains(&x)
        })
        .collect();

    let eroded: Vec<bool> = (0..w * h)
        .map(|idx| cross_test(&raw, w, h, idx, true))
        .collect();
    (0..w * h)
        .map(|idx| cross_test(&eroded, w, h, idx, false))
        .collect()
}

/// Whether all (`erode`) or any (dilate) pixels in the 3x3 cross around
/// `idx` are set. Out-of-frame neighbours are ignored.
fn cross_test(mask: &[bool], w: usize, h: usize, idx: usize, erode: bool) -> bool {
    let (x, y) = (idx % w, idx / w);
    let left = x > 0 && mask[idx - 1];
    let right = x + 1 < w && mask[idx + 1];
    let up = y > 0 && mask[idx - w];
    let down = y + 1 < h && mask[idx + w];
    if erode {
        mask[idx]
            && (x == 0 || left)
            && (x + 1 == w || right)
            && (y == 0 || up)
            && (y + 1 == h || down)
    } else {
        mask[idx] || left || right || up || down
    }
}

/// 32x32 hue/saturation histogram, min-max normalised. `None` when no pixel
/// passes the mask.
fn hs_histogram(hsv: &[(u8, u8, u8)], mask: Option<&[bool]>) -> Option<Vec<f32>> {
    let mut bins = vec![0.0f32; HUE_BINS * SAT_BINS];
    let mut counted = 0usize;
    for (idx, (hue, sat, _)) in hsv.iter().enumerate() {
        if mask.is_some_and(|mask| !mask[idx]) {
            continue;
        }
        let hue_bin = (usize::from(*hue) * HUE_BINS / 180).min(HUE_BINS - 1);
        let sat_bin = usize::from(*sat) * SAT_BINS / 256;
        bins[hue_bin * SAT_BINS + sat_bin] += 1.0;
        counted += 1;
    }
    if counted == 0 {
        return None;
    }
    let max = bins.iter().copied().fold(f32::MIN, f32::max);
    let min = bins.iter().copied().fold(f32::MAX, f32::min);
    let span = max - min;
    for bin in &mut bins {
        *bin = if span > 0.0 { (*bin - min) / span } else { 0.0 };
    }
    Some(bins)
}

/// `1 - d` where `d` is the Bhattacharyya distance as OpenCV defines it.
fn bhattacharyya_similarity(left: &[f32], right: &[f32]) -> f64 {
    let sum_left: f64 = left.iter().map(|v| f64::from(*v)).sum();
    let sum_right: f64 = right.iter().map(|v| f64::from(*v)).sum();
    if sum_left * sum_right <= f64::EPSILON {
        return 0.0;
    }
    let overlap: f64 = left
        .iter()
        .zip(right)
        .map(|(a, b)| (f64::from(*a) * f64::from(*b)).sqrt())
        .sum();
    let distance = (1.0 - overlap / (sum_left * sum_right).sqrt()).max(0.0).sqrt();
    1.0 - distance.clamp(0.0, 1.0)
}
