use indexmap::IndexMap;

use crate::catalog::{EventRecord, RecordType};
use crate::text::normalize_text;

fn is_unset(part: &str) -> bool {
    matches!(part.trim().to_ascii_lowercase().as_str(), "" | "none" | "null")
}

/// Splits a trainee-specific key (`trainee/<name>/None/None/<event>[#step]`)
/// into its event part and optional step suffix. Keys for other types, the
/// general trainee, or with a concrete attribute/rarity yield `None`.
fn trainee_specific(key: &str) -> Option<(String, Option<&str>)> {
    let (base, step) = match key.split_once('#') {
        Some((base, step)) => (base, Some(step)),
        None => (key, None),
    };
    let parts: Vec<&str> = base.split('/').collect();
    if parts.len() < 5 {
        return None;
    }
    if RecordType::parse(parts[0]) != Some(RecordType::Trainee) {
        return None;
    }
    let name = parts[1].trim().to_ascii_lowercase();
    if name == "general" || is_unset(&name) {
        return None;
    }
    if !is_unset(parts[2]) || !is_unset(parts[3]) {
        return None;
    }
    Some((parts[4..].join("/"), step))
}

pub(crate) fn generalize_trainee_key(key: &str) -> Option<String> {
    let (event, step) = trainee_specific(key)?;
    let mut generalized = format!("trainee/general/None/None/{event}");
    if let Some(step) = step {
        generalized.push('#');
        generalized.push_str(step);
    }
    Some(generalized)
}

/// Maps every trainee-specific override onto the general trainee keys so an
/// event shown under the shared trainee record still honours it. Existing
/// overrides and earlier aliases are never replaced.
pub(crate) fn build_alias_overrides(overrides: &IndexMap<String, u32>) -> IndexMap<String, u32> {
    let mut aliases: IndexMap<String, u32> = IndexMap::new();
    for (key, pick) in overrides {
        let Some(alias) = generalize_trainee_key(key) else {
            continue;
        };
        let (base, step) = match alias.split_once('#') {
            Some((base, step)) => (base.to_string(), Some(step.to_string())),
            None => (alias.clone(), None),
        };

        let mut candidates = vec![alias.clone(), base.clone()];
        match step.as_deref() {
            None => candidates.push(format!("{base}#s1")),
            Some(step) if !step.is_empty() && !step.to_ascii_lowercase().starts_with('s') => {
                candidates.push(format!("{base}#s{step}"));
            }
            Some(_) => {}
        }

        for candidate in candidates {
            if candidate.is_empty()
                || overrides.contains_key(&candidate)
                || aliases.contains_key(&candidate)
            {
                continue;
            }
            tracing::debug!(alias = %candidate, source = %key, pick, "alias override mapped");
            aliases.insert(candidate, *pick);
        }
    }
    aliases
}

fn parse_step(step: &str) -> Option<u32> {
    let step = step.trim().to_ascii_lowercase();
    if step.is_empty() {
        return Some(1);
    }
    step.strip_prefix('s').unwrap_or(&step).parse().ok()
}

/// For a general trainee record, finds the first trainee-specific override
/// naming the same event at the same step. Unparseable steps match any step.
pub(crate) fn match_specific_trainee_override(
    overrides: &IndexMap<String, u32>,
    rec: &EventRecord,
) -> Option<u32> {
    let target_name = normalize_text(&rec.event_name);
    let target_step = rec.step();
    overrides.iter().find_map(|(key, pick)| {
        let (event, step) = trainee_specific(key)?;
        if normalize_text(&event) != target_name {
            return None;
        }
        match parse_step(step.unwrap_or("")) {
            Some(idx) if idx != target_step => None,
            _ => Some(*pick),
        }
    })
}
