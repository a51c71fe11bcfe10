use std::path::{Path, PathBuf};

use evpick_contracts::text::{normalize_text, partial_ratio, ratio, token_set_ratio};
use evpick_contracts::{Catalog, EventRecord, RecordType, ScoreWeights};
use image::RgbImage;
use serde::Serialize;

use crate::imaging::{hash_similarity, phash_file, phash_rgb, PortraitMatcher, PreparedRegion};

/// One observation of an event screen, as far as retrieval cares.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub ocr_title: String,
    pub type_hint: Option<RecordType>,
    pub name_hint: Option<String>,
    pub rarity_hint: Option<String>,
    pub attribute_hint: Option<String>,
    pub chain_step_hint: Option<u32>,
    pub portrait_image: Option<RgbImage>,
    pub portrait_path: Option<PathBuf>,
    pub portrait_phash: Option<u64>,
    pub preferred_trainee_name: Option<String>,
}

impl Query {
    pub fn new(ocr_title: impl Into<String>) -> Self {
        Self {
            ocr_title: ocr_title.into(),
            ..Self::default()
        }
    }

    pub fn with_type_hint(mut self, record_type: RecordType) -> Self {
        self.type_hint = Some(record_type);
        self
    }

    pub fn with_name_hint(mut self, name: &str) -> Self {
        self.name_hint = Some(name.to_string());
        self
    }

    pub fn with_rarity_hint(mut self, rarity: &str) -> Self {
        self.rarity_hint = Some(rarity.to_string());
        self
    }

    pub fn with_attribute_hint(mut self, attribute: &str) -> Self {
        self.attribute_hint = Some(attribute.to_string());
        self
    }

    pub fn with_chain_step_hint(mut self, step: u32) -> Self {
        self.chain_step_hint = Some(step);
        self
    }

    pub fn with_portrait(mut self, image: RgbImage) -> Self {
        self.portrait_image = Some(image);
        self
    }

    pub fn with_portrait_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.portrait_path = Some(path.into());
        self
    }

    pub fn with_portrait_phash(mut self, hash: u64) -> Self {
        self.portrait_phash = Some(hash);
        self
    }

    pub fn with_preferred_trainee(mut self, name: &str) -> Self {
        self.preferred_trainee_name = Some(name.to_string());
        self
    }

    fn hint(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(normalize_text)
            .filter(|hint| !hint.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult<'a> {
    pub rec: &'a EventRecord,
    pub score: f64,
    pub text_sim: f64,
    pub img_sim: f64,
    pub hint_bonus: f64,
}

/// Ranks catalog records against a noisy observation.
#[derive(Debug)]
pub struct Retriever {
    weights: ScoreWeights,
    matcher: PortraitMatcher,
}

impl Default for Retriever {
    fn default() -> Self {
        Self::new(ScoreWeights::default())
    }
}

impl Retriever {
    pub fn new(weights: ScoreWeights) -> Self {
        let matcher = PortraitMatcher::new(&weights);
        Self { weights, matcher }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn matcher(&self) -> &PortraitMatcher {
        &self.matcher
    }

    /// Fuzzy similarity of an already-normalised query against a record
    /// title, in `[0, 1]`.
    pub fn title_similarity(&self, query_norm: &str, rec: &EventRecord) -> f64 {
        if query_norm.is_empty() {
            return 0.0;
        }
        if query_norm == rec.title_norm {
            return 1.0;
        }
        let w = &self.weights;
        let blended = w.text_token_set * token_set_ratio(query_norm, &rec.title_norm)
            + w.text_ratio * ratio(query_norm, &rec.title_norm)
            + w.text_partial * partial_ratio(query_norm, &rec.title_norm);
        blended.clamp(0.0, 1.0)
    }

    pub fn retrieve_best<'a>(
        &self,
        catalog: &'a Catalog,
        query: &Query,
        top_k: usize,
        min_score: f64,
    ) -> Vec<MatchResult<'a>> {
        let query_norm = normalize_text(&query.ocr_title);
        let portrait_hash = portrait_hash(query);

        let pool = filter_by_hints(catalog.records().iter().collect(), query);
        let region = query
            .portrait_image
            .as_ref()
            .and_then(|image| self.matcher.prepare_region(image));
        let pool = match &region {
            Some(_) => self.cv_candidates(pool, &query_norm),
            None => pool,
        };

        let mut results: Vec<MatchResult<'a>> = pool
            .into_iter()
            .map(|rec| self.score_record(rec, query, &query_norm, portrait_hash, region.as_ref()))
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.text_sim.total_cmp(&a.text_sim))
                .then_with(|| b.img_sim.total_cmp(&a.img_sim))
        });
        results.retain(|result| result.score >= min_score);

        if query.type_hint == Some(RecordType::Trainee) && results.len() > 1 {
            if let Some(preferred) = Query::hint(&query.preferred_trainee_name) {
                promote_trainee(&mut results, &preferred);
            }
        }
        results.truncate(top_k);

        if let Some(best) = results.first() {
            tracing::debug!(
                key_step = %best.rec.key_step,
                score = best.score,
                text = best.text_sim,
                img = best.img_sim,
                candidates = results.len(),
                "retrieval"
            );
        }
        results
    }

    /// Narrows the pool to records whose title plausibly matches, so that
    /// portrait comparison runs on a bounded set.
    fn cv_candidates<'a>(&self, pool: Vec<&'a EventRecord>, query_norm: &str) -> Vec<&'a EventRecord> {
        let w = &self.weights;
        let mut scored: Vec<(&'a EventRecord, f64)> = pool
            .iter()
            .map(|rec| (*rec, self.title_similarity(query_norm, rec)))
            .filter(|(_, sim)| *sim > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let above = |threshold: f64| -> Vec<&'a EventRecord> {
            scored
                .iter()
                .filter(|(_, sim)| *sim >= threshold)
                .map(|(rec, _)| *rec)
                .collect()
        };
        let mut chosen = above(w.cv_title_threshold);
        if chosen.len() < w.cv_min_candidates {
            chosen = above(w.cv_title_relaxed);
        }
        if chosen.len() < w.cv_min_candidates {
            chosen = scored.iter().map(|(rec, _)| *rec).collect();
        }
        chosen.truncate(w.cv_max_candidates);

        if chosen.is_empty() {
            pool
        } else {
            chosen
        }
    }

    fn score_record<'a>(
        &self,
        rec: &'a EventRecord,
        query: &Query,
        query_norm: &str,
        portrait_hash: Option<u64>,
        region: Option<&PreparedRegion>,
    ) -> MatchResult<'a> {
        let w = &self.weights;
        let text_sim = self.title_similarity(query_norm, rec);

        let phash_sim = match (portrait_hash, rec.phash64) {
            (Some(query_hash), Some(rec_hash)) => hash_similarity(query_hash, rec_hash),
            _ => 0.0,
        };
        let cv_sim = region.and_then(|region| {
            if rec.image_variants.is_empty() {
                let path = rec.image_path.as_deref()?;
                self.matcher.similarity(region, Path::new(path))
            } else {
                self.matcher.best_similarity(region, &rec.image_variants)
            }
        });
        let img_sim = match cv_sim {
            Some(cv) => w.image_cv * cv + w.image_phash * phash_sim,
            None => phash_sim,
        }
        .clamp(0.0, 1.0);

        let hint_bonus = self.hint_bonus(rec, query);
        MatchResult {
            rec,
            score: w.text * text_sim + w.image * img_sim + hint_bonus,
            text_sim,
            img_sim,
            hint_bonus,
        }
    }

    fn hint_bonus(&self, rec: &EventRecord, query: &Query) -> f64 {
        let w = &self.weights;
        let mut bonus = 0.0;
        if query.type_hint == Some(rec.record_type) {
            bonus += w.bonus_type;
        }
        if Query::hint(&query.name_hint).is_some_and(|hint| hint == normalize_text(&rec.name)) {
            bonus += w.bonus_name;
        }
        if Query::hint(&query.rarity_hint).is_some_and(|hint| hint == normalize_text(&rec.rarity)) {
            bonus += w.bonus_rarity;
        }
        if Query::hint(&query.attribute_hint).is_some_and(|hint| hint == normalize_text(&rec.attribute)) {
            bonus += w.bonus_attribute;
        }
        if query.chain_step_hint == Some(rec.step()) {
            bonus += w.bonus_chain_step;
        }
        bonus
    }
}

fn portrait_hash(query: &Query) -> Option<u64> {
    if let Some(hash) = query.portrait_phash {
        return Some(hash);
    }
    if let Some(image) = &query.portrait_image {
        if image.width() > 0 && image.height() > 0 {
            return Some(phash_rgb(image));
        }
    }
    let path = query.portrait_path.as_deref()?;
    match phash_file(path) {
        Ok(hash) => Some(hash),
        Err(err) => {
            tracing::debug!(error = %err, "portrait path unusable");
            None
        }
    }
}

/// Applies each hint in turn, keeping the previous pool whenever a hint
/// would leave nothing.
fn filter_by_hints<'a>(pool: Vec<&'a EventRecord>, query: &Query) -> Vec<&'a EventRecord> {
    fn narrow<'a>(pool: Vec<&'a EventRecord>, keep: impl Fn(&EventRecord) -> bool) -> Vec<&'a EventRecord> {
        let narrowed: Vec<&'a EventRecord> = pool.iter().copied().filter(|rec| keep(rec)).collect();
        if narrowed.is_empty() {
            pool
        } else {
            narrowed
        }
    }

    let mut pool = pool;
    if let Some(record_type) = query.type_hint {
        pool = narrow(pool, |rec| rec.record_type == record_type);
    }
    if let Some(name) = Query::hint(&query.name_hint) {
        pool = narrow(pool, |rec| normalize_text(&rec.name) == name);
    }
    if let Some(rarity) = Query::hint(&query.rarity_hint) {
        pool = narrow(pool, |rec| normalize_text(&rec.rarity) == rarity);
    }
    if let Some(attribute) = Query::hint(&query.attribute_hint) {
        pool = narrow(pool, |rec| normalize_text(&rec.attribute) == attribute);
    }
    if let Some(step) = query.chain_step_hint {
        pool = narrow(pool, |rec| rec.step() == step);
    }
    pool
}

fn promote_trainee(results: &mut Vec<MatchResult<'_>>, preferred: &str) {
    let idx = results
        .iter()
        .position(|result| normalize_text(&result.rec.name) == preferred)
        .or_else(|| results.iter().position(|result| result.rec.is_general_trainee()));
    if let Some(idx) = idx.filter(|idx| *idx > 0) {
        let promoted = results.remove(idx);
        results.insert(0, promoted);
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use proptest::prelude::*;

    use super::*;

    fn rec(record_type: RecordType, name: &str, title: &str, step: Option<u32>) -> EventRecord {
        EventRecord::new(record_type, name, "None", "None", title, step, vec![vec![], vec![]])
    }

    fn support(name: &str, attribute: &str, rarity: &str, title: &str) -> EventRecord {
        EventRecord::new(RecordType::Support, name, rarity, attribute, title, None, vec![vec![], vec![]])
    }

    fn catalog() -> Catalog {
        Catalog::from_records(vec![
            rec(RecordType::Scenario, "URA Finale", "New Year's Resolutions", None),
            rec(RecordType::Scenario, "URA Finale", "Extra Training", None),
            support("Kitasan Black", "SPD", "SSR", "Paying It Forward"),
            support("Kitasan Black", "SPD", "SSR", "Lucky Star"),
            support("Fine Motion", "WIT", "SSR", "Lucky Star"),
            rec(RecordType::Trainee, "general", "Dance Lesson", None),
            rec(RecordType::Trainee, "Special Week", "Dance Lesson", None),
            rec(RecordType::Trainee, "Silence Suzuka", "Dance Lesson", None),
        ])
    }

    #[test]
    fn exact_title_ranks_first() {
        let catalog = catalog();
        let results = Retriever::default().retrieve_best(&catalog, &Query::new("Extra Training"), 3, 0.5);
        assert_eq!(results[0].rec.event_name, "Extra Training");
        assert_eq!(results[0].text_sim, 1.0);
        assert!(results.iter().all(|result| result.score >= 0.5));
    }

    #[test]
    fn chain_step_hint_prefers_matching_step() {
        let catalog = Catalog::from_records(vec![
            rec(RecordType::Support, "Vodka", "Paying It Forward", Some(1)),
            rec(RecordType::Support, "Vodka", "Paying It Forward", Some(2)),
        ]);
        let query = Query::new("Paying It Forward").with_chain_step_hint(2);
        let results = Retriever::default().retrieve_best(&catalog, &query, 3, 0.0);
        assert_eq!(results[0].rec.step(), 2);
        let step_one = results.iter().find(|result| result.rec.step() == 1);
        assert!(step_one.map_or(true, |result| result.score < results[0].score));
    }

    #[test]
    fn hints_add_bonus_and_break_ties() {
        let catalog = catalog();
        let query = Query::new("Lucky Star")
            .with_type_hint(RecordType::Support)
            .with_attribute_hint("wit");
        let results = Retriever::default().retrieve_best(&catalog, &query, 3, 0.0);
        assert_eq!(results[0].rec.name, "Fine Motion");
        assert!((results[0].hint_bonus - 0.16).abs() < 1e-9);
    }

    #[test]
    fn unmatched_hints_do_not_empty_the_pool() {
        let catalog = catalog();
        let query = Query::new("Lucky Star")
            .with_name_hint("Nobody")
            .with_rarity_hint("UR")
            .with_chain_step_hint(7);
        let results = Retriever::default().retrieve_best(&catalog, &query, 3, 0.5);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.rec.event_name == "Lucky Star"));
        assert!(results.iter().all(|result| result.hint_bonus == 0.0));
    }

    #[test]
    fn empty_query_scores_no_text() {
        let catalog = catalog();
        let results = Retriever::default().retrieve_best(&catalog, &Query::new("  "), 10, 0.0);
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|result| result.text_sim == 0.0 && result.score == 0.0));
    }

    #[test]
    fn preferred_trainee_is_promoted() {
        let catalog = catalog();
        let query = Query::new("Dance Lesson")
            .with_type_hint(RecordType::Trainee)
            .with_preferred_trainee("silence suzuka");
        let results = Retriever::default().retrieve_best(&catalog, &query, 3, 0.5);
        assert_eq!(results[0].rec.name, "Silence Suzuka");

        let query = Query::new("Dance Lesson")
            .with_type_hint(RecordType::Trainee)
            .with_preferred_trainee("Gold Ship");
        let results = Retriever::default().retrieve_best(&catalog, &query, 3, 0.5);
        assert!(results[0].rec.is_general_trainee());
    }

    #[test]
    fn portrait_breaks_title_ties() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let face = |seed: u32| {
            RgbImage::from_fn(40, 40, |x, y| {
                let v = ((x / 5 * 7 + y / 5 * 13 + seed) * 37 % 251) as u8;
                Rgb([v, 255 - v, (v / 3).wrapping_add(seed as u8)])
            })
        };
        let path_a = temp.path().join("a.png");
        let path_b = temp.path().join("b.png");
        face(3).save(&path_a)?;
        face(90).save(&path_b)?;

        let mut rec_a = support("Alpha", "SPD", "SSR", "Shared Title");
        rec_a.image_path = Some(path_a.to_string_lossy().to_string());
        let mut rec_b = support("Beta", "SPD", "SSR", "Shared Title");
        rec_b.image_variants = vec![path_b.to_string_lossy().to_string()];
        let catalog = Catalog::from_records(vec![rec_b, rec_a]);

        let retriever = Retriever::default();
        let query = Query::new("Shared Title").with_portrait(face(3));
        let results = retriever.retrieve_best(&catalog, &query, 2, 0.0);
        assert_eq!(results[0].rec.name, "Alpha");
        assert!(results[0].img_sim > results[1].img_sim);
        assert_eq!(retriever.matcher().cached_templates(), 2);
        Ok(())
    }

    #[test]
    fn explicit_phash_beats_portrait_path() {
        let mut target = support("Alpha", "SPD", "SSR", "Shared Title");
        target.phash64 = Some(0xFFFF_0000_FFFF_0000);
        let mut other = support("Beta", "SPD", "SSR", "Shared Title");
        other.phash64 = Some(0x0000_FFFF_0000_FFFF);
        let catalog = Catalog::from_records(vec![other, target]);

        let query = Query::new("Shared Title")
            .with_portrait_phash(0xFFFF_0000_FFFF_0000)
            .with_portrait_path("/nonexistent/portrait.png");
        let results = Retriever::default().retrieve_best(&catalog, &query, 2, 0.0);
        assert_eq!(results[0].rec.name, "Alpha");
        assert_eq!(results[0].img_sim, 1.0);
        assert_eq!(results[1].img_sim, 0.0);
    }

    proptest! {
        #[test]
        fn ranking_is_deterministic_and_bounded(
            title in "[a-zA-Z' ]{0,24}",
            step in proptest::option::of(1u32..4),
            hash in proptest::option::of(any::<u64>()),
        ) {
            let catalog = catalog();
            let retriever = Retriever::default();
            let mut query = Query::new(title).with_type_hint(RecordType::Support);
            query.chain_step_hint = step;
            query.portrait_phash = hash;

            let first = retriever.retrieve_best(&catalog, &query, 8, 0.0);
            let second = retriever.retrieve_best(&catalog, &query, 8, 0.0);
            let keys = |results: &[MatchResult<'_>]| -> Vec<(String, f64)> {
                results.iter().map(|r| (r.rec.key_step.clone(), r.score)).collect()
            };
            prop_assert_eq!(keys(&first), keys(&second));

            let max = retriever.weights().max_score() + 1e-9;
            for result in &first {
                prop_assert!((0.0..=1.0).contains(&result.text_sim));
                prop_assert!((0.0..=1.0).contains(&result.img_sim));
                prop_assert!(result.score <= max);
            }
            for pair in first.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
