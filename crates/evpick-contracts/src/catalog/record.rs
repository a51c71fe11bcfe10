use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::text::normalize_text;

/// One possible result of picking an option. Kept as a free-form object
/// because the scraped data carries many optional fields (`energy`, `speed`,
/// `hints`, `status`, `team`, ...) and numeric values may be range strings.
pub type Outcome = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Support,
    Trainee,
    Scenario,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [
        RecordType::Support,
        RecordType::Trainee,
        RecordType::Scenario,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Support => "support",
            RecordType::Trainee => "trainee",
            RecordType::Scenario => "scenario",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "support" => Some(RecordType::Support),
            "trainee" => Some(RecordType::Trainee),
            "scenario" => Some(RecordType::Scenario),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub key: String,
    pub key_step: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub name: String,
    pub rarity: String,
    pub attribute: String,
    pub event_name: String,
    #[serde(default)]
    pub chain_step: Option<u32>,
    #[serde(default)]
    pub default_preference: Option<u32>,
    #[serde(with = "option_map")]
    pub options: Vec<Vec<Outcome>>,
    pub title_norm: String,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub phash64: Option<u64>,
    #[serde(default)]
    pub image_variants: Vec<String>,
    #[serde(default)]
    pub event_kind: Option<String>,
}

impl EventRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record_type: RecordType,
        name: &str,
        rarity: &str,
        attribute: &str,
        event_name: &str,
        chain_step: Option<u32>,
        options: Vec<Vec<Outcome>>,
    ) -> Self {
        let key = record_key(record_type, name, attribute, rarity, event_name);
        let key_step = format!("{key}#s{}", chain_step.unwrap_or(1));
        Self {
            key,
            key_step,
            record_type,
            name: name.to_string(),
            rarity: rarity.to_string(),
            attribute: attribute.to_string(),
            event_name: event_name.to_string(),
            chain_step,
            default_preference: None,
            options,
            title_norm: normalize_text(event_name),
            image_path: None,
            phash64: None,
            image_variants: Vec::new(),
            event_kind: None,
        }
    }

    pub fn step(&self) -> u32 {
        self.chain_step.unwrap_or(1)
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    /// Outcomes for a 1-based option number; empty when out of range.
    pub fn outcomes(&self, option: usize) -> &[Outcome] {
        option
            .checked_sub(1)
            .and_then(|idx| self.options.get(idx))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_general_trainee(&self) -> bool {
        self.record_type == RecordType::Trainee
            && normalize_text(&self.name) == "general"
            && self.rarity == "None"
            && self.attribute == "None"
    }
}

pub fn record_key(
    record_type: RecordType,
    name: &str,
    attribute: &str,
    rarity: &str,
    event_name: &str,
) -> String {
    format!("{record_type}/{name}/{attribute}/{rarity}/{event_name}")
}

/// Converts an option map keyed by `"1"`, `"2"`, ... into a dense 0-based
/// list ordered by key number. Non-numeric and zero keys are ignored and the
/// remaining numbers are renumbered in order, so `{"1", "3"}` yields two
/// options. A single outcome object is accepted in place of a list.
pub fn options_from_keyed(raw: &Map<String, Value>) -> Vec<Vec<Outcome>> {
    let mut numbered: Vec<(u64, Vec<Outcome>)> = raw
        .iter()
        .filter_map(|(key, value)| {
            let number = key.trim().parse::<u64>().ok().filter(|n| *n >= 1)?;
            Some((number, outcomes_from_value(value)))
        })
        .collect();
    numbered.sort_by_key(|(number, _)| *number);
    numbered.into_iter().map(|(_, outcomes)| outcomes).collect()
}

fn outcomes_from_value(value: &Value) -> Vec<Outcome> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect(),
        Value::Object(obj) => vec![obj.clone()],
        _ => Vec::new(),
    }
}

mod option_map {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::{Map, Value};

    use super::{options_from_keyed, Outcome};

    pub fn serialize<S>(options: &[Vec<Outcome>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(options.len()))?;
        for (idx, outcomes) in options.iter().enumerate() {
            map.serialize_entry(&(idx + 1).to_string(), outcomes)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<Outcome>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        Ok(options_from_keyed(&raw))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn new_record_builds_step_aware_keys() {
        let rec = EventRecord::new(
            RecordType::Support,
            "Kitasan Black",
            "SSR",
            "SPD",
            "Paying It Forward",
            Some(2),
            vec![vec![], vec![]],
        );
        assert_eq!(rec.key, "support/Kitasan Black/SPD/SSR/Paying It Forward");
        assert_eq!(rec.key_step, "support/Kitasan Black/SPD/SSR/Paying It Forward#s2");
        assert_eq!(rec.title_norm, "paying it forward");
        assert_eq!(rec.step(), 2);
    }

    #[test]
    fn options_are_ordered_and_renumbered() {
        let options = options_from_keyed(&obj(json!({
            "2": [{"energy": 10}],
            "1": {"speed": 5},
            "4": [{"wit": 3}],
            "x": [{"guts": 1}],
        })));
        assert_eq!(options.len(), 3);
        assert_eq!(options[0][0]["speed"], json!(5));
        assert_eq!(options[1][0]["energy"], json!(10));
        assert_eq!(options[2][0]["wit"], json!(3));
    }

    #[test]
    fn huge_option_keys_do_not_allocate_slots() {
        let options = options_from_keyed(&obj(json!({
            "1": [{"speed": 5}],
            "4000000000": [{"energy": 10}],
        })));
        assert_eq!(options.len(), 2);
        assert_eq!(options[1][0]["energy"], json!(10));
    }

    #[test]
    fn options_round_trip_through_string_keys() -> anyhow::Result<()> {
        let mut rec = EventRecord::new(
            RecordType::Scenario,
            "Ura Finale",
            "None",
            "None",
            "New Year",
            None,
            vec![vec![obj(json!({"energy": 20}))], vec![obj(json!({"skill_pts": 30}))]],
        );
        rec.default_preference = Some(1);
        let value = serde_json::to_value(&rec)?;
        assert_eq!(value["options"]["2"][0]["skill_pts"], json!(30));
        assert_eq!(value["type"], json!("scenario"));
        let parsed: EventRecord = serde_json::from_value(value)?;
        assert_eq!(parsed, rec);
        assert_eq!(parsed.outcomes(1)[0]["energy"], json!(20));
        assert!(parsed.outcomes(0).is_empty());
        assert!(parsed.outcomes(3).is_empty());
        Ok(())
    }
}
