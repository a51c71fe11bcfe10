use std::collections::{BTreeMap, BTreeSet};

use evpick_contracts::rewards::{extract_reward_categories, max_positive_energy, select_candidate_by_priority};
use evpick_contracts::{DecisionTuning, EventRecord, RecordType, RewardCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustReason {
    RewardPriority,
    EnergySafe,
}

impl AdjustReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustReason::RewardPriority => "reward_priority",
            AdjustReason::EnergySafe => "energy_safe",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyCheck {
    pub pick: u32,
    pub adjusted_from: Option<(u32, AdjustReason)>,
    pub matched_category: Option<RewardCategory>,
    pub gains: BTreeMap<usize, i64>,
    pub categories: BTreeMap<usize, BTreeSet<RewardCategory>>,
}

/// Extra headroom above the cap. PAL support dates may overshoot slightly.
pub fn overcap_allowance(rec: &EventRecord, tuning: &DecisionTuning) -> i64 {
    if rec.record_type == RecordType::Support && rec.attribute.trim().eq_ignore_ascii_case("pal") {
        tuning.pal_overcap_allowance
    } else {
        0
    }
}

/// Option numbers starting at `pick` and wrapping around.
pub fn rotation(pick: u32, count: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let start = (pick.max(1) as usize - 1) % count;
    (0..count).map(|shift| (start + shift) % count + 1).collect()
}

/// Keeps `pick` when its energy gain fits under the cap, otherwise moves to
/// the first safe option by reward priority and then rotation order. With no
/// safe option at all the pick stays.
pub fn reselect_for_energy(
    rec: &EventRecord,
    pick: u32,
    current_energy: i64,
    max_energy_cap: i64,
    allowance: i64,
    priority: &[RewardCategory],
) -> EnergyCheck {
    let count = rec.option_count();
    let order = rotation(pick, count);

    let mut gains = BTreeMap::new();
    let mut categories = BTreeMap::new();
    let mut safe = Vec::new();
    for option in 1..=count {
        let outcomes = rec.outcomes(option);
        let gain = max_positive_energy(outcomes);
        if gain <= 0 || current_energy + gain <= max_energy_cap + allowance {
            safe.push(option);
        }
        gains.insert(option, gain);
        categories.insert(option, extract_reward_categories(outcomes));
    }

    let mut check = EnergyCheck {
        pick,
        adjusted_from: None,
        matched_category: None,
        gains,
        categories,
    };
    if safe.contains(&(pick as usize)) {
        return check;
    }
    if let Some((candidate, category)) = select_candidate_by_priority(&order, &safe, &check.categories, priority) {
        let candidate = candidate as u32;
        if candidate != pick {
            let reason = if category.is_some() {
                AdjustReason::RewardPriority
            } else {
                AdjustReason::EnergySafe
            };
            check.adjusted_from = Some((pick, reason));
            check.pick = candidate;
        }
        check.matched_category = category;
    }
    check
}
