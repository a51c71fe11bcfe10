use serde::{Deserialize, Serialize};

/// Retrieval weights. Values were tuned against the game's rendering and
/// OCR noise; every field can be overridden from a tuning file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub text: f64,
    pub image: f64,

    pub text_token_set: f64,
    pub text_ratio: f64,
    pub text_partial: f64,

    pub image_cv: f64,
    pub image_phash: f64,

    pub cv_template: f64,
    pub cv_hash: f64,
    pub cv_histogram: f64,
    pub template_edge: f64,
    pub template_scale_min: f64,
    pub template_scale_max: f64,
    pub template_scale_steps: usize,

    pub bonus_type: f64,
    pub bonus_name: f64,
    pub bonus_rarity: f64,
    pub bonus_attribute: f64,
    pub bonus_chain_step: f64,

    pub cv_title_threshold: f64,
    pub cv_title_relaxed: f64,
    pub cv_min_candidates: usize,
    pub cv_max_candidates: usize,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            text: 0.82,
            image: 0.11,
            text_token_set: 0.5,
            text_ratio: 0.3,
            text_partial: 0.2,
            image_cv: 0.9,
            image_phash: 0.1,
            cv_template: 0.48,
            cv_hash: 0.17,
            cv_histogram: 0.35,
            template_edge: 0.25,
            template_scale_min: 0.90,
            template_scale_max: 1.10,
            template_scale_steps: 12,
            bonus_type: 0.04,
            bonus_name: 0.08,
            bonus_rarity: 0.12,
            bonus_attribute: 0.12,
            bonus_chain_step: 0.12,
            cv_title_threshold: 0.9,
            cv_title_relaxed: 0.45,
            cv_min_candidates: 1,
            cv_max_candidates: 100,
        }
    }
}

impl ScoreWeights {
    pub fn max_hint_bonus(&self) -> f64 {
        self.bonus_type
            + self.bonus_name
            + self.bonus_rarity
            + self.bonus_attribute
            + self.bonus_chain_step
    }

    /// Upper bound of any retrieval score under these weights.
    pub fn max_score(&self) -> f64 {
        self.text + self.image + self.max_hint_bonus()
    }

    pub fn template_scales(&self) -> Vec<f64> {
        let steps = self.template_scale_steps.max(1);
        if steps == 1 {
            return vec![(self.template_scale_min + self.template_scale_max) / 2.0];
        }
        let span = self.template_scale_max - self.template_scale_min;
        (0..steps)
            .map(|i| self.template_scale_min + span * i as f64 / (steps - 1) as f64)
            .collect()
    }
}

/// Thresholds used while reading an event screen and choosing a click.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionTuning {
    pub choice_min_confidence: f32,

    pub chain_hue_center: u8,
    pub chain_hue_tolerance: u8,
    pub chain_saturation_min: u8,
    pub chain_value_min: u8,
    pub chain_coverage_min: f64,

    pub banner_pad_x: f32,
    pub banner_pad_y: f32,
    pub banner_width_factor: f32,
    pub square_aspect_min: f32,
    pub square_aspect_max: f32,
    pub header_split_square: f32,
    pub header_split_tall: f32,
    /// Central OCR band `[x1, y1, x2, y2]` as frame fractions, used when no
    /// portrait was detected.
    pub fallback_band: [f32; 4],

    pub top_k: usize,
    pub min_score: f64,
    pub chain_retry_min_score: f64,

    pub team_match_threshold: f64,
    pub recount_delay_ms: u64,
    pub pal_overcap_allowance: i64,
}

impl Default for DecisionTuning {
    fn default() -> Self {
        Self {
            choice_min_confidence: 0.60,
            chain_hue_center: 105,
            chain_hue_tolerance: 12,
            chain_saturation_min: 80,
            chain_value_min: 100,
            chain_coverage_min: 0.20,
            banner_pad_x: 0.05,
            banner_pad_y: 0.10,
            banner_width_factor: 6.5,
            square_aspect_min: 0.85,
            square_aspect_max: 1.15,
            header_split_square: 0.30,
            header_split_tall: 0.40,
            fallback_band: [0.10, 0.30, 0.90, 0.55],
            top_k: 3,
            min_score: 0.5,
            chain_retry_min_score: 0.6,
            team_match_threshold: 0.55,
            recount_delay_ms: 800,
            pal_overcap_allowance: 10,
        }
    }
}
