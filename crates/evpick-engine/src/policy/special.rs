use evpick_contracts::text::fuzzy_contains;
use evpick_contracts::{DecisionTuning, Detection, EventRecord};
use image::RgbImage;
use serde_json::{json, Map, Value};

use super::perception::{ocr_or_empty, OcrEngine};
use crate::imaging::crop;

/// What a special case sees of the current screen.
pub struct SpecialContext<'a> {
    pub frame: &'a RgbImage,
    pub choices: &'a [Detection],
    pub ocr: &'a dyn OcrEngine,
    pub tuning: &'a DecisionTuning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialOutcome {
    /// 1-based index into the visible choices.
    pub pick: u32,
    pub debug: Map<String, Value>,
}

/// An event whose option must be located on screen rather than by number.
/// `resolve` returns `None` when the case does not apply after all.
pub struct SpecialCase {
    pub name: &'static str,
    pub key_step: &'static str,
    pub resolve: fn(&EventRecord, u32, &SpecialContext<'_>) -> Option<SpecialOutcome>,
}

pub const SPECIAL_CASES: &[SpecialCase] = &[SpecialCase {
    name: "team_selection",
    key_step: "scenario/Unity Cup/None/None/A Team at Last#s1",
    resolve: resolve_team_selection,
}];

pub fn find_special_case(key_step: &str) -> Option<&'static SpecialCase> {
    SPECIAL_CASES.iter().find(|case| match glob::Pattern::new(case.key_step) {
        Ok(pattern) => pattern.matches(key_step),
        Err(_) => case.key_step == key_step,
    })
}

/// Finds the visible option naming the team the operator chose. The team
/// list on screen does not follow catalog order. Without a match the
/// bottommost option is taken.
fn resolve_team_selection(rec: &EventRecord, pick: u32, ctx: &SpecialContext<'_>) -> Option<SpecialOutcome> {
    let desired = rec
        .outcomes(pick as usize)
        .first()
        .and_then(|outcome| outcome.get("team"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|team| !team.is_empty());
    let Some(desired) = desired else {
        tracing::warn!(key_step = %rec.key_step, pick, "team selection without team text");
        return None;
    };

    let mut ocr_results = Vec::with_capacity(ctx.choices.len());
    let mut best: Option<(usize, f64)> = None;
    for (idx, choice) in ctx.choices.iter().enumerate() {
        let text = ocr_or_empty(ctx.ocr, &crop(ctx.frame, &choice.bbox));
        let (hit, score) = fuzzy_contains(&text, desired, ctx.tuning.team_match_threshold);
        if hit && best.map_or(true, |(_, current)| score > current) {
            best = Some((idx, score));
        }
        ocr_results.push(text);
    }

    let mut debug = Map::new();
    debug.insert("desired_pick".into(), json!(pick));
    debug.insert("desired_team".into(), json!(desired));
    debug.insert("available_choices".into(), json!(ctx.choices.len()));
    debug.insert("ocr_results".into(), json!(ocr_results));
    debug.insert("original_pick".into(), json!(pick));

    let resolved = match best {
        Some((idx, score)) => {
            let resolved = (idx + 1) as u32;
            tracing::info!(team = desired, pick = resolved, original = pick, score, "team matched on screen");
            debug.insert("matched_index".into(), json!(resolved));
            debug.insert("match_score".into(), json!(score));
            resolved
        }
        None => {
            let bottom = ctx.choices.len() as u32;
            tracing::warn!(team = desired, pick = bottom, "team not found; taking bottom option");
            debug.insert("no_match".into(), json!(true));
            debug.insert("fallback_to_bottom".into(), json!(bottom));
            bottom
        }
    };
    Some(SpecialOutcome { pick: resolved, debug })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use evpick_contracts::{BoundingBox, RecordType};

    use super::*;

    /// Reads text by the crop's top edge, which the test frame makes unique.
    struct RowOcr(HashMap<u32, String>);

    impl OcrEngine for RowOcr {
        fn text(&self, image: &RgbImage) -> anyhow::Result<String> {
            let row = u32::from(image.get_pixel(0, 0)[0]);
            Ok(self.0.get(&row).cloned().unwrap_or_default())
        }
    }

    fn team_event() -> EventRecord {
        let option = |team: &str| vec![json!({"team": team}).as_object().cloned().unwrap_or_default()];
        EventRecord::new(
            RecordType::Scenario,
            "Unity Cup",
            "None",
            "None",
            "A Team at Last",
            None,
            vec![option("Team Blue"), option("Team Happy"), option("Team Carrot")],
        )
    }

    fn frame() -> RgbImage {
        RgbImage::from_fn(200, 200, |_, y| image::Rgb([y as u8, 0, 0]))
    }

    fn choices() -> Vec<Detection> {
        [20.0, 60.0, 100.0]
            .into_iter()
            .map(|top| Detection::new("event_choice", 0.9, BoundingBox::new(10.0, top, 190.0, top + 30.0)))
            .collect()
    }

    fn ocr() -> RowOcr {
        RowOcr(HashMap::from([
            (20, "Team Carrot".to_string()),
            (60, "Team Happ1ness".to_string()),
            (100, "Team Blue".to_string()),
        ]))
    }

    #[test]
    fn dispatch_is_keyed_by_step() {
        let rec = team_event();
        assert_eq!(find_special_case(&rec.key_step).map(|case| case.name), Some("team_selection"));
        assert!(find_special_case("scenario/Unity Cup/None/None/A Team at Last#s2").is_none());
    }

    #[test]
    fn team_is_found_by_text_not_position() {
        let (frame, choices, ocr) = (frame(), choices(), ocr());
        let tuning = DecisionTuning::default();
        let ctx = SpecialContext { frame: &frame, choices: &choices, ocr: &ocr, tuning: &tuning };
        let outcome = resolve_team_selection(&team_event(), 1, &ctx);
        assert_eq!(outcome.as_ref().map(|o| o.pick), Some(3));
        let outcome = resolve_team_selection(&team_event(), 3, &ctx);
        assert_eq!(outcome.map(|o| o.pick), Some(1));
    }

    #[test]
    fn unknown_team_takes_bottom_option() {
        let (frame, choices) = (frame(), choices());
        let ocr = RowOcr(HashMap::new());
        let tuning = DecisionTuning::default();
        let ctx = SpecialContext { frame: &frame, choices: &choices, ocr: &ocr, tuning: &tuning };
        let outcome = resolve_team_selection(&team_event(), 2, &ctx);
        assert_eq!(outcome.as_ref().map(|o| o.pick), Some(3));
        assert_eq!(outcome.map(|o| o.debug["no_match"].clone()), Some(json!(true)));
    }

    #[test]
    fn missing_team_text_does_not_fire() {
        let (frame, choices, ocr) = (frame(), choices(), ocr());
        let tuning = DecisionTuning::default();
        let ctx = SpecialContext { frame: &frame, choices: &choices, ocr: &ocr, tuning: &tuning };
        let rec = EventRecord::new(
            RecordType::Scenario,
            "Unity Cup",
            "None",
            "None",
            "A Team at Last",
            None,
            vec![vec![], vec![]],
        );
        assert!(resolve_team_selection(&rec, 1, &ctx).is_none());
    }
}
