use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCategory {
    Energy,
    Stats,
    SkillPts,
    Hints,
}

pub const DEFAULT_REWARD_PRIORITY: [RewardCategory; 3] = [
    RewardCategory::SkillPts,
    RewardCategory::Stats,
    RewardCategory::Hints,
];

impl RewardCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RewardCategory::Energy => "energy",
            RewardCategory::Stats => "stats",
            RewardCategory::SkillPts => "skill_pts",
            RewardCategory::Hints => "hints",
        }
    }

    /// Maps an outcome field or config token onto its coarse category.
    pub fn from_alias(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "energy" => Some(RewardCategory::Energy),
            "skill_pts" | "skill_points" => Some(RewardCategory::SkillPts),
            "hint" | "hints" => Some(RewardCategory::Hints),
            "speed" | "spd" | "stamina" | "sta" | "power" | "pwr" | "guts" | "gut" | "wit"
            | "wisdom" | "intelligence" | "stats" => Some(RewardCategory::Stats),
            _ => None,
        }
    }
}

/// Parses a configured priority list, dropping unknown tokens and
/// duplicates. Anything unusable yields the default order.
pub fn normalize_reward_priority(raw: Option<&Value>) -> Vec<RewardCategory> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return DEFAULT_REWARD_PRIORITY.to_vec();
    };
    let mut result: Vec<RewardCategory> = Vec::new();
    for category in items
        .iter()
        .filter_map(Value::as_str)
        .filter_map(RewardCategory::from_alias)
    {
        if !result.contains(&category) {
            result.push(category);
        }
    }
    if result.is_empty() {
        return DEFAULT_REWARD_PRIORITY.to_vec();
    }
    result
}

fn first_number(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|ch| ch.is_ascii_digit())?;
    let mut begin = start;
    if begin > 0 && matches!(chars[begin - 1], '+' | '-') {
        begin -= 1;
    }
    let mut end = start;
    let mut seen_dot = false;
    while end < chars.len() {
        let ch = chars[end];
        if ch.is_ascii_digit() {
            end += 1;
        } else if ch == '.' && !seen_dot && end + 1 < chars.len() && chars[end + 1].is_ascii_digit() {
            seen_dot = true;
            end += 1;
        } else {
            break;
        }
    }
    chars[begin..end].iter().collect::<String>().parse().ok()
}

/// Every value a numeric field can take: plain numbers, `"+15"`, or
/// alternatives such as `"+5/+10"`. Non-numeric input yields `[0.0]`.
pub fn range_values(value: &Value) -> Vec<f64> {
    match value {
        Value::Number(number) => vec![number.as_f64().unwrap_or(0.0)],
        Value::String(text) => {
            let values: Vec<f64> = text
                .trim()
                .split('/')
                .map(|part| {
                    let part = part.trim();
                    part.trim_start_matches('+')
                        .parse::<f64>()
                        .ok()
                        .or_else(|| first_number(part))
                        .unwrap_or(0.0)
                })
                .collect();
            if values.is_empty() {
                vec![0.0]
            } else {
                values
            }
        }
        _ => vec![0.0],
    }
}

/// Numeric reading of a field, taking the largest alternative of a range.
/// `None` when the value carries no number at all.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let parsed: Vec<f64> = text
                .trim()
                .split('/')
                .filter_map(|part| {
                    let part = part.trim();
                    part.trim_start_matches('+')
                        .parse::<f64>()
                        .ok()
                        .or_else(|| first_number(part))
                })
                .collect();
            parsed.into_iter().reduce(f64::max)
        }
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

fn visit_fields<'a>(value: &'a Value, visit: &mut dyn FnMut(&str, &'a Value)) {
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                visit(key, child);
                visit_fields(child, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_fields(item, visit);
            }
        }
        _ => {}
    }
}

fn visit_outcomes<'a>(outcomes: &'a [Outcome], visit: &mut dyn FnMut(&str, &'a Value)) {
    for outcome in outcomes {
        for (key, child) in outcome {
            visit(key, child);
            visit_fields(child, visit);
        }
    }
}

/// Largest positive energy gain any outcome can roll, 0 when none.
pub fn max_positive_energy(outcomes: &[Outcome]) -> i64 {
    let mut max_gain = 0i64;
    visit_outcomes(outcomes, &mut |key, value| {
        if key.trim().eq_ignore_ascii_case("energy") {
            if let Some(gain) = coerce_number(value).filter(|gain| *gain > 0.0) {
                max_gain = max_gain.max(gain as i64);
            }
        }
    });
    max_gain
}

pub fn extract_reward_categories(outcomes: &[Outcome]) -> BTreeSet<RewardCategory> {
    let mut categories = BTreeSet::new();
    visit_outcomes(outcomes, &mut |key, value| {
        let Some(category) = RewardCategory::from_alias(key) else {
            return;
        };
        let present = match category {
            RewardCategory::SkillPts | RewardCategory::Energy => {
                coerce_number(value).map_or(true, |n| n > 0.0)
            }
            RewardCategory::Hints => match value {
                Value::Array(items) => items.iter().any(truthy),
                other => truthy(other),
            },
            RewardCategory::Stats => {
                value.is_object()
                    || value.is_array()
                    || coerce_number(value).is_some_and(|n| n > 0.0)
            }
        };
        if present {
            categories.insert(category);
        }
    });
    categories
}

/// Walks `priority` and returns the first option in `candidate_order` that
/// is safe and offers that category. Without any category hit the first safe
/// option in rotation order is returned with no matched category.
pub fn select_candidate_by_priority(
    candidate_order: &[usize],
    safe_candidates: &[usize],
    option_categories: &BTreeMap<usize, BTreeSet<RewardCategory>>,
    priority: &[RewardCategory],
) -> Option<(usize, Option<RewardCategory>)> {
    if safe_candidates.is_empty() {
        return None;
    }
    let priority: &[RewardCategory] = if priority.is_empty() {
        &DEFAULT_REWARD_PRIORITY
    } else {
        priority
    };

    for category in priority {
        for option in candidate_order {
            if !safe_candidates.contains(option) {
                continue;
            }
            if option_categories
                .get(option)
                .is_some_and(|cats| cats.contains(category))
            {
                return Some((*option, Some(*category)));
            }
        }
    }

    candidate_order
        .iter()
        .find(|option| safe_candidates.contains(option))
        .map(|option| (*option, None))
}

/// Weights of the build-time worst-case heuristic that seeds
/// `default_preference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeWeights {
    pub energy: f64,
    pub stat: f64,
    pub skill_pts: f64,
    pub hint: f64,
    pub bond: f64,
    pub mood: f64,
    pub stat_weights: BTreeMap<String, f64>,
}

impl Default for OutcomeWeights {
    fn default() -> Self {
        let stat_weights = [
            ("speed", 5.0),
            ("stamina", 4.0),
            ("power", 3.0),
            ("wit", 2.0),
            ("guts", 1.0),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();
        Self {
            energy: 100.0,
            stat: 10.0,
            skill_pts: 2.0,
            hint: 1.0,
            bond: 0.3,
            mood: 2.0,
            stat_weights,
        }
    }
}

impl OutcomeWeights {
    fn worst(outcome: &Outcome, field: &str) -> f64 {
        outcome
            .get(field)
            .map(range_values)
            .and_then(|values| values.into_iter().reduce(f64::min))
            .unwrap_or(0.0)
    }

    pub fn score_outcome(&self, outcome: &Outcome) -> f64 {
        let energy = Self::worst(outcome, "energy");
        let mut stats_sum: f64 = self
            .stat_weights
            .iter()
            .map(|(stat, weight)| weight * Self::worst(outcome, stat))
            .sum();
        if let Some(random) = outcome.get("random_stats").and_then(Value::as_object) {
            let mean_weight = if self.stat_weights.is_empty() {
                0.0
            } else {
                self.stat_weights.values().sum::<f64>() / self.stat_weights.len() as f64
            };
            let count = random.get("count").and_then(coerce_number).unwrap_or(0.0);
            let amount = random.get("amount").and_then(coerce_number).unwrap_or(0.0);
            stats_sum += mean_weight * count * amount;
        }
        let skill_pts = Self::worst(outcome, "skill_pts");
        let hints = match outcome.get("hints") {
            Some(Value::Array(items)) => items.len() as f64,
            Some(Value::String(text)) => text.chars().count() as f64,
            _ => 0.0,
        };
        let bond = Self::worst(outcome, "bond");
        let mood = Self::worst(outcome, "mood");

        self.energy * energy
            + self.stat * stats_sum
            + self.skill_pts * skill_pts
            + self.hint * hints
            + self.bond * bond
            + self.mood * mood
    }

    /// Option whose worst outcome scores highest; ties keep the lower
    /// number. Options without outcomes are ignored. Returns a 1-based
    /// option number, 1 when nothing is scoreable.
    pub fn choose_default_preference(&self, options: &[Vec<Outcome>]) -> u32 {
        let mut best_option = 1u32;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, outcomes) in options.iter().enumerate() {
            let Some(worst_case) = outcomes
                .iter()
                .map(|outcome| self.score_outcome(outcome))
                .reduce(f64::min)
            else {
                continue;
            };
            if worst_case > best_score {
                best_score = worst_case;
                best_option = idx as u32 + 1;
            }
        }
        best_option
    }
}
