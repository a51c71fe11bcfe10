use anyhow::Result;
use evpick_contracts::{BoundingBox, DecisionTuning, Detection};
use image::RgbImage;

use crate::imaging::{crop, rgb_to_hsv};

pub const EVENT_CARD: &str = "event_card";
pub const EVENT_CHAIN: &str = "event_chain";
pub const EVENT_CHOICE: &str = "event_choice";

/// Object detector over the live screen.
pub trait Detector: Send {
    fn recognize(&mut self) -> Result<(RgbImage, Vec<Detection>)>;
}

pub trait OcrEngine: Send + Sync {
    fn text(&self, image: &RgbImage) -> Result<String>;
}

/// Input dispatcher. `clicks` is 1 for a tap and 2 for a double tap.
pub trait Controller: Send {
    fn click(&mut self, bbox: &BoundingBox, clicks: u32) -> Result<()>;
}

/// Highest-confidence portrait card; the first one wins ties.
pub fn pick_event_card(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .filter(|det| det.class_name == EVENT_CARD)
        .fold(None, |best: Option<&Detection>, det| match best {
            Some(current) if current.confidence >= det.confidence => Some(current),
            _ => Some(det),
        })
}

/// Whether a chain marker is lit: enough of its pixels sit in the blue hue
/// band with the configured saturation and brightness.
pub fn is_blue_chain(frame: &RgbImage, det: &Detection, tuning: &DecisionTuning) -> bool {
    let patch = crop(frame, &det.bbox);
    if patch.width() <= 1 || patch.height() <= 1 {
        return false;
    }

    let center = i32::from(tuning.chain_hue_center);
    let tol = i32::from(tuning.chain_hue_tolerance);
    let lo = (center - tol).rem_euclid(180);
    let hi = (center + tol).rem_euclid(180);
    let in_band = |hue: i32| {
        if lo <= hi {
            (lo..=hi).contains(&hue)
        } else {
            hue >= lo || hue <= hi
        }
    };

    let lit = patch
        .pixels()
        .filter(|pixel| {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            in_band(i32::from(h)) && s >= tuning.chain_saturation_min && v >= tuning.chain_value_min
        })
        .count();
    let total = (patch.width() * patch.height()).max(1) as f64;
    lit as f64 / total >= tuning.chain_coverage_min
}

/// Number of lit chain markers, `None` when none are visible.
pub fn count_chain_steps(frame: &RgbImage, detections: &[Detection], tuning: &DecisionTuning) -> Option<u32> {
    let lit = detections
        .iter()
        .filter(|det| det.class_name == EVENT_CHAIN)
        .filter(|det| is_blue_chain(frame, det, tuning))
        .count();
    u32::try_from(lit).ok().filter(|count| *count > 0)
}

/// Confident option buttons, top to bottom.
pub fn visible_choices(detections: &[Detection], min_confidence: f32) -> Vec<Detection> {
    let mut choices: Vec<Detection> = detections
        .iter()
        .filter(|det| det.class_name == EVENT_CHOICE && det.confidence >= min_confidence)
        .cloned()
        .collect();
    choices.sort_by(|a, b| a.bbox.y1.total_cmp(&b.bbox.y1));
    choices
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BannerText {
    /// Ribbon text such as "Support Card Event".
    pub header: String,
    pub description: String,
}

/// Banner region to the right of the portrait card.
pub fn banner_region(frame: &RgbImage, card: &BoundingBox, tuning: &DecisionTuning) -> BoundingBox {
    let max_x = frame.width().saturating_sub(1) as f32;
    let max_y = frame.height().saturating_sub(1) as f32;
    let (card_w, card_h) = (card.width(), card.height());
    BoundingBox::new(
        card.x2 + tuning.banner_pad_x * card_w,
        (card.y1 - tuning.banner_pad_y * card_h).max(0.0),
        max_x.min(card.x2 + tuning.banner_width_factor * card_w),
        max_y.min(card.y2 + tuning.banner_pad_y * card_h),
    )
}

pub fn read_banner(
    ocr: &dyn OcrEngine,
    frame: &RgbImage,
    card: &BoundingBox,
    tuning: &DecisionTuning,
) -> BannerText {
    let banner = crop(frame, &banner_region(frame, card, tuning));
    let (width, height) = banner.dimensions();

    let aspect = card.height() / card.width().max(1e-6);
    let split = if (tuning.square_aspect_min..=tuning.square_aspect_max).contains(&aspect) {
        tuning.header_split_square
    } else {
        tuning.header_split_tall
    };
    let split_y = ((split * height as f32) as u32).min(height);

    let header = image::imageops::crop_imm(&banner, 0, 0, width, split_y).to_image();
    let description = image::imageops::crop_imm(&banner, 0, split_y, width, height - split_y).to_image();
    BannerText {
        header: ocr_or_empty(ocr, &header),
        description: ocr_or_empty(ocr, &description),
    }
}

/// OCR of the central band used when no portrait was detected.
pub fn read_fallback_band(ocr: &dyn OcrEngine, frame: &RgbImage, tuning: &DecisionTuning) -> String {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let [x1, y1, x2, y2] = tuning.fallback_band;
    let band = crop(
        frame,
        &BoundingBox::new(
            (x1 * width).floor(),
            (y1 * height).floor(),
            (x2 * width).floor(),
            (y2 * height).floor(),
        ),
    );
    ocr_or_empty(ocr, &band)
}

/// OCR failures read as empty text.
pub fn ocr_or_empty(ocr: &dyn OcrEngine, image: &RgbImage) -> String {
    if image.width() == 0 || image.height() == 0 {
        return String::new();
    }
    match ocr.text(image) {
        Ok(text) => text.trim().to_string(),
        Err(err) => {
            tracing::warn!(error = %err, "ocr failed; treating as empty");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    struct SizeOcr;

    impl OcrEngine for SizeOcr {
        fn text(&self, image: &RgbImage) -> Result<String> {
            Ok(format!(" {}x{} ", image.width(), image.height()))
        }
    }

    struct BrokenOcr;

    impl OcrEngine for BrokenOcr {
        fn text(&self, _image: &RgbImage) -> Result<String> {
            anyhow::bail!("engine offline")
        }
    }

    fn det(class_name: &str, confidence: f32, bbox: [f32; 4]) -> Detection {
        Detection::new(class_name, confidence, BoundingBox::from(bbox))
    }

    #[test]
    fn card_choice_uses_highest_confidence() {
        let dets = vec![
            det(EVENT_CARD, 0.7, [0.0, 0.0, 10.0, 10.0]),
            det(EVENT_CHOICE, 0.99, [0.0, 0.0, 10.0, 10.0]),
            det(EVENT_CARD, 0.9, [5.0, 5.0, 15.0, 15.0]),
            det(EVENT_CARD, 0.9, [6.0, 6.0, 16.0, 16.0]),
        ];
        let card = pick_event_card(&dets).map(|card| card.bbox.x1);
        assert_eq!(card, Some(5.0));
        assert!(pick_event_card(&dets[1..2]).is_none());
    }

    #[test]
    fn choices_are_filtered_and_sorted() {
        let dets = vec![
            det(EVENT_CHOICE, 0.9, [0.0, 300.0, 10.0, 320.0]),
            det(EVENT_CHOICE, 0.4, [0.0, 50.0, 10.0, 70.0]),
            det(EVENT_CHOICE, 0.6, [0.0, 100.0, 10.0, 120.0]),
            det(EVENT_CHAIN, 0.9, [0.0, 0.0, 10.0, 10.0]),
        ];
        let choices = visible_choices(&dets, 0.60);
        let tops: Vec<f32> = choices.iter().map(|choice| choice.bbox.y1).collect();
        assert_eq!(tops, vec![100.0, 300.0]);
    }

    #[test]
    fn only_blue_chain_markers_count() {
        let mut frame = RgbImage::from_pixel(100, 40, Rgb([240, 240, 240]));
        for y in 0..20 {
            for x in 0..20 {
                frame.put_pixel(x, y, Rgb([30, 110, 230]));
                frame.put_pixel(x + 30, y, Rgb([30, 110, 230]));
            }
        }
        let tuning = DecisionTuning::default();
        let dets = vec![
            det(EVENT_CHAIN, 0.9, [0.0, 0.0, 20.0, 20.0]),
            det(EVENT_CHAIN, 0.9, [30.0, 0.0, 50.0, 20.0]),
            det(EVENT_CHAIN, 0.9, [60.0, 0.0, 80.0, 20.0]),
        ];
        assert_eq!(count_chain_steps(&frame, &dets, &tuning), Some(2));
        assert_eq!(count_chain_steps(&frame, &dets[2..], &tuning), None);
        assert_eq!(count_chain_steps(&frame, &[], &tuning), None);
    }

    #[test]
    fn hue_band_wraps_around_zero() {
        let frame = RgbImage::from_pixel(10, 10, Rgb([255, 0, 8]));
        let tuning = DecisionTuning {
            chain_hue_center: 2,
            chain_hue_tolerance: 6,
            ..DecisionTuning::default()
        };
        assert!(is_blue_chain(&frame, &det(EVENT_CHAIN, 1.0, [0.0, 0.0, 9.0, 9.0]), &tuning));
    }

    #[test]
    fn banner_split_depends_on_card_shape() {
        let frame = RgbImage::new(1000, 600);
        let tuning = DecisionTuning::default();

        let square = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
        let text = read_banner(&SizeOcr, &frame, &square, &tuning);
        assert_eq!(text.header, "645x36");
        assert_eq!(text.description, "645x84");

        let tall = BoundingBox::new(100.0, 100.0, 200.0, 250.0);
        let text = read_banner(&SizeOcr, &frame, &tall, &tuning);
        assert_eq!(text.header, "645x72");
        assert_eq!(text.description, "645x108");
    }

    #[test]
    fn ocr_errors_read_as_empty() {
        let frame = RgbImage::new(200, 100);
        let tuning = DecisionTuning::default();
        assert_eq!(read_fallback_band(&BrokenOcr, &frame, &tuning), "");
        assert_eq!(read_fallback_band(&SizeOcr, &frame, &tuning), "160x25");
    }
}
