mod energy;
mod perception;
mod special;

use std::sync::Arc;
use std::time::Duration;

use evpick_contracts::trace::DecisionLog;
use evpick_contracts::{
    Catalog, DecisionTuning, Detection, EventDecision, EventPolicy, EventRecord, RecordType,
};
use image::RgbImage;
use serde_json::{json, Map, Value};

pub use energy::{overcap_allowance, reselect_for_energy, rotation, AdjustReason, EnergyCheck};
pub use perception::{
    banner_region, count_chain_steps, is_blue_chain, ocr_or_empty, pick_event_card, read_banner,
    read_fallback_band, visible_choices, BannerText, Controller, Detector, OcrEngine, EVENT_CARD,
    EVENT_CHAIN, EVENT_CHOICE,
};
pub use special::{find_special_case, SpecialCase, SpecialContext, SpecialOutcome, SPECIAL_CASES};

use crate::imaging::crop;
use crate::retrieval::{MatchResult, Query, Retriever};

/// The option clicked on the previous event screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastClick {
    pub key_step: String,
    pub pick: u32,
    pub expected_n: usize,
}

/// Decides and clicks one option per event screen.
pub struct EventFlow {
    catalog: Arc<Catalog>,
    prefs: Arc<dyn EventPolicy>,
    retriever: Retriever,
    detector: Box<dyn Detector>,
    ocr: Box<dyn OcrEngine>,
    controller: Box<dyn Controller>,
    tuning: DecisionTuning,
    trace: Option<DecisionLog>,
    last_event_clicked: Option<LastClick>,
}

impl EventFlow {
    pub fn new(
        catalog: Arc<Catalog>,
        prefs: Arc<dyn EventPolicy>,
        detector: Box<dyn Detector>,
        ocr: Box<dyn OcrEngine>,
        controller: Box<dyn Controller>,
    ) -> Self {
        Self {
            catalog,
            prefs,
            retriever: Retriever::default(),
            detector,
            ocr,
            controller,
            tuning: DecisionTuning::default(),
            trace: None,
            last_event_clicked: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_tuning(mut self, tuning: DecisionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_trace(mut self, trace: DecisionLog) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn last_event_clicked(&self) -> Option<&LastClick> {
        self.last_event_clicked.as_ref()
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Reads the event screen, picks an option and clicks it. Perception
    /// problems never surface as errors; they end in a click on the topmost
    /// visible option (or no click when nothing is visible).
    pub fn process_event_screen(
        &mut self,
        frame: &RgbImage,
        detections: &[Detection],
        current_energy: Option<i64>,
        max_energy_cap: i64,
    ) -> EventDecision {
        let decision = self.decide(frame, detections, current_energy, max_energy_cap);
        if let Some(trace) = &self.trace {
            if let Err(err) = trace.record_decision(&decision) {
                tracing::warn!(error = %err, "failed to append decision trace");
            }
        }
        decision
    }

    fn decide(
        &mut self,
        frame: &RgbImage,
        detections: &[Detection],
        current_energy: Option<i64>,
        max_energy_cap: i64,
    ) -> EventDecision {
        let mut debug = Map::new();
        debug.insert("current_energy".into(), json!(current_energy));
        debug.insert("max_energy_cap".into(), json!(max_energy_cap));

        let card = pick_event_card(detections).cloned();
        let chain_step_hint = count_chain_steps(frame, detections, &self.tuning)
            .or_else(|| card.as_ref().map(|_| 1));
        let mut choices = visible_choices(detections, self.tuning.choice_min_confidence);
        debug.insert("chain_step_hint".into(), json!(chain_step_hint));
        debug.insert("num_choices".into(), json!(choices.len()));
        debug.insert("has_event_card".into(), json!(card.is_some()));

        let banner = match &card {
            Some(card) => read_banner(self.ocr.as_ref(), frame, &card.bbox, &self.tuning),
            None => BannerText {
                header: read_fallback_band(self.ocr.as_ref(), frame, &self.tuning),
                description: String::new(),
            },
        };
        debug.insert("ocr_title".into(), json!(banner.header));
        debug.insert("ocr_description".into(), json!(banner.description));

        let header = banner.header.to_lowercase();
        let type_hint = if header.contains("support") {
            Some(RecordType::Support)
        } else if header.contains("trainee") {
            Some(RecordType::Trainee)
        } else {
            None
        };
        let text = if banner.description.is_empty() {
            banner.header.clone()
        } else {
            banner.description.clone()
        };
        let mut query = Query::new(text);
        query.type_hint = type_hint;
        query.chain_step_hint = chain_step_hint;
        query.portrait_image = card.as_ref().map(|card| crop(frame, &card.bbox));
        if type_hint == Some(RecordType::Trainee) {
            query.preferred_trainee_name = self.prefs.preferred_trainee_name().map(str::to_string);
        }

        let catalog = Arc::clone(&self.catalog);
        let mut candidates =
            self.retriever
                .retrieve_best(&catalog, &query, self.tuning.top_k, self.tuning.min_score);
        if candidates.is_empty() && chain_step_hint.is_some_and(|step| step != 1) {
            query.chain_step_hint = Some(1);
            candidates = self.retriever.retrieve_best(
                &catalog,
                &query,
                self.tuning.top_k,
                self.tuning.chain_retry_min_score,
            );
            debug.insert(
                "chain_step_hint_fallback".into(),
                json!({"from": chain_step_hint, "to": 1, "candidates_found": candidates.len()}),
            );
            if candidates.is_empty() {
                tracing::warn!(from = ?chain_step_hint, "chain hint fallback found nothing");
            } else {
                tracing::info!(from = ?chain_step_hint, "chain hint fallback succeeded");
            }
        }

        let Some(best) = candidates.first().cloned() else {
            tracing::warn!(title = %query.ocr_title, "no catalog match; clicking top option");
            return self.fallback_click_top(&choices, debug);
        };
        let rec = best.rec;
        debug.insert("chain_step_hint_used".into(), json!(query.chain_step_hint));
        debug.insert("top_match".into(), top_match(&best));

        let mut pick = self.prefs.pick_for(rec);
        debug.insert("pick_resolved".into(), json!(pick));

        let mut special_fired = false;
        if let Some(case) = find_special_case(&rec.key_step) {
            let ctx = SpecialContext {
                frame,
                choices: &choices,
                ocr: self.ocr.as_ref(),
                tuning: &self.tuning,
            };
            if let Some(outcome) = (case.resolve)(rec, pick, &ctx) {
                pick = outcome.pick;
                special_fired = true;
                debug.insert(case.name.into(), Value::Object(outcome.debug));
            }
        }

        let expected_n = rec.option_count();
        debug.insert("expected_n_options".into(), json!(expected_n));
        if expected_n == 0 {
            tracing::warn!(key_step = %rec.key_step, "matched record has no options; clicking top option");
            return self.fallback_click_top(&choices, debug);
        }

        if !special_fired {
            if choices.len() != expected_n {
                choices = self.recount_choices(choices, expected_n, &mut debug);
                if choices.len() != expected_n {
                    if pick as usize <= choices.len() {
                        debug.insert("partial_match_fallback".into(), json!(true));
                    } else if self.is_confirmation_phase(rec, choices.len(), expected_n) {
                        debug.insert("partial_match_confirmation".into(), json!(true));
                    } else {
                        tracing::warn!(
                            pick,
                            detected = choices.len(),
                            score = best.score,
                            "preferred option not visible; clicking top option"
                        );
                        return self.fallback_click_top(&choices, debug);
                    }
                }
            }
            if pick < 1 || pick as usize > expected_n {
                tracing::warn!(pick, expected_n, "pick out of range; clicking top option");
                return self.fallback_click_top(&choices, debug);
            }
        }

        let avoid_overflow = self.prefs.should_avoid_energy(rec);
        debug.insert("avoid_energy_overflow".into(), json!(avoid_overflow));
        if let Some(energy) = current_energy.filter(|_| !special_fired && avoid_overflow) {
            let priority = self.prefs.reward_priority_for(rec);
            let allowance = overcap_allowance(rec, &self.tuning);
            let check = reselect_for_energy(rec, pick, energy, max_energy_cap, allowance, &priority);
            record_energy_check(&check, &mut debug);
            if let Some((from, reason)) = check.adjusted_from {
                tracing::info!(from, to = check.pick, reason = reason.as_str(), energy, "pick adjusted for energy");
            }
            pick = check.pick;
        }

        if self.is_confirmation_phase(rec, choices.len(), expected_n) {
            tracing::info!(key_step = %rec.key_step, from = pick, "confirmation phase; taking option 1");
            pick = 1;
            debug.insert("confirmation_phase_override".into(), json!(true));
        }

        if pick < 1 || pick as usize > choices.len() {
            debug.insert("available_choices".into(), json!(choices.len()));
            tracing::warn!(pick, available = choices.len(), "pick not visible; clicking top option");
            return self.fallback_click_top(&choices, debug);
        }

        let target = choices[pick as usize - 1].bbox;
        if let Err(err) = self.controller.click(&target, 2) {
            tracing::warn!(error = %err, "click failed");
            debug.insert("click_error".into(), json!(err.to_string()));
        }
        self.last_event_clicked = Some(LastClick {
            key_step: rec.key_step.clone(),
            pick,
            expected_n,
        });
        tracing::info!(
            pick,
            key_step = %rec.key_step,
            score = best.score,
            energy = ?current_energy,
            cap = max_energy_cap,
            "clicked event option"
        );

        EventDecision {
            matched_key: Some(rec.key.clone()),
            matched_key_step: Some(rec.key_step.clone()),
            pick_option: pick,
            clicked_box: Some(target),
            debug,
        }
    }

    /// One delayed recapture. The new detections replace the old ones when
    /// they match the catalog or at least show more options.
    fn recount_choices(
        &mut self,
        choices: Vec<Detection>,
        expected_n: usize,
        debug: &mut Map<String, Value>,
    ) -> Vec<Detection> {
        tracing::warn!(detected = choices.len(), expected_n, "option count mismatch; recapturing");
        if self.tuning.recount_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.tuning.recount_delay_ms));
        }
        let retry = match self.detector.recognize() {
            Ok((_, detections)) => visible_choices(&detections, self.tuning.choice_min_confidence),
            Err(err) => {
                tracing::warn!(error = %err, "recapture failed");
                debug.insert("retry_error".into(), json!(err.to_string()));
                Vec::new()
            }
        };
        debug.insert("retry_num_choices".into(), json!(retry.len()));

        if retry.len() == expected_n {
            tracing::info!(expected_n, "recapture matched the expected option count");
            return retry;
        }
        if retry.len() > choices.len() {
            debug.insert("used_retry_choices".into(), json!(true));
            return retry;
        }
        choices
    }

    fn is_confirmation_phase(&self, rec: &EventRecord, visible: usize, expected_n: usize) -> bool {
        self.last_event_clicked.as_ref().is_some_and(|last| {
            last.key_step == rec.key_step && visible < expected_n && last.pick > 1
        })
    }

    fn fallback_click_top(&mut self, choices: &[Detection], debug: Map<String, Value>) -> EventDecision {
        self.last_event_clicked = None;
        let Some(top) = choices.first() else {
            tracing::info!("no event option to click");
            return EventDecision {
                matched_key: None,
                matched_key_step: None,
                pick_option: 1,
                clicked_box: None,
                debug,
            };
        };
        let mut debug = debug;
        if let Err(err) = self.controller.click(&top.bbox, 1) {
            tracing::warn!(error = %err, "fallback click failed");
            debug.insert("click_error".into(), json!(err.to_string()));
        }
        tracing::info!(confidence = top.confidence, "fallback: clicked top option");
        EventDecision {
            matched_key: None,
            matched_key_step: None,
            pick_option: 1,
            clicked_box: Some(top.bbox),
            debug,
        }
    }
}

fn top_match(best: &MatchResult<'_>) -> Value {
    json!({
        "key": best.rec.key,
        "key_step": best.rec.key_step,
        "score": best.score,
        "text_sim": best.text_sim,
        "img_sim": best.img_sim,
        "bonus": best.hint_bonus,
    })
}

fn record_energy_check(check: &EnergyCheck, debug: &mut Map<String, Value>) {
    if let Some((from, reason)) = check.adjusted_from {
        debug.insert(
            "pick_adjusted_due_to_energy".into(),
            json!({"from": from, "to": check.pick, "reason": reason.as_str()}),
        );
    }
    if let Some(category) = check.matched_category {
        debug.insert("reward_priority_match".into(), json!(category.as_str()));
    }
    let gains: Map<String, Value> = check
        .gains
        .iter()
        .map(|(option, gain)| (option.to_string(), json!(gain)))
        .collect();
    debug.insert("energy_gain_by_option".into(), Value::Object(gains));
    let categories: Map<String, Value> = check
        .categories
        .iter()
        .filter(|(_, cats)| !cats.is_empty())
        .map(|(option, cats)| {
            let names: Vec<&str> = cats.iter().map(|cat| cat.as_str()).collect();
            (option.to_string(), json!(names))
        })
        .collect();
    debug.insert("reward_categories_by_option".into(), Value::Object(categories));
}
