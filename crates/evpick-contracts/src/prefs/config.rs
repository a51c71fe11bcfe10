use std::path::Path;

use serde_json::{Map, Value};

use super::{EntityKey, EntityPrefs, PrefsError, UserPrefs};
use crate::catalog::RecordType;
use crate::rewards::normalize_reward_priority;

/// Reads a loosely typed flag. Accepts booleans, numbers and the strings
/// true/false, 1/0, yes/no, on/off; anything else yields `default`.
pub fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(default),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        },
        _ => default,
    }
}

fn coerce_pick(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|n| n.trunc() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_pick(pick: i64) -> u32 {
    u32::try_from(pick.max(1)).unwrap_or(u32::MAX)
}

/// `camelCase` key first, then its `snake_case` spelling; JSON null counts
/// as absent.
fn either<'a>(obj: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    obj.get(camel)
        .filter(|value| !value.is_null())
        .or_else(|| obj.get(snake).filter(|value| !value.is_null()))
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn entity_prefs(entry: &Map<String, Value>) -> EntityPrefs {
    EntityPrefs {
        avoid_energy_overflow: coerce_bool(
            either(entry, "avoidEnergyOverflow", "avoid_energy_overflow"),
            true,
        ),
        reward_priority: either(entry, "rewardPriority", "reward_priority")
            .map(|raw| normalize_reward_priority(Some(raw))),
    }
}

/// Active preset of an application config: `general.activeScenario`
/// (default `ura`) selects `scenarios.<s>.presets` and `activePresetId`;
/// the top-level `presets` list is used when that branch has none. Falls
/// back to the first preset when the id is unknown.
pub fn active_preset(cfg: &Value) -> Option<&Map<String, Value>> {
    let active_scenario = cfg
        .get("general")
        .and_then(|general| general.get("activeScenario"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or("ura");
    let branch = cfg
        .get("scenarios")
        .and_then(|scenarios| scenarios.get(active_scenario));

    let scenario_presets = branch
        .and_then(|branch| branch.get("presets"))
        .and_then(Value::as_array)
        .filter(|presets| !presets.is_empty());
    let (presets, active_id) = match scenario_presets {
        Some(presets) => (presets, branch.and_then(|branch| branch.get("activePresetId"))),
        None => (
            cfg.get("presets").and_then(Value::as_array)?,
            cfg.get("activePresetId"),
        ),
    };

    let chosen = active_id
        .filter(|id| !id.is_null())
        .and_then(|id| presets.iter().find(|preset| preset.get("id") == Some(id)));
    chosen
        .or_else(|| presets.first())
        .and_then(Value::as_object)
}

impl UserPrefs {
    /// Preferences of the active preset inside the application config.
    /// Missing sections produce defaults.
    pub fn from_config(cfg: &Value) -> Self {
        let Some(preset) = active_preset(cfg) else {
            tracing::debug!("no preset in config, using default event preferences");
            return Self::default();
        };
        let empty = Map::new();
        let setup = preset
            .get("event_setup")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let prefs = setup.get("prefs").and_then(Value::as_object).unwrap_or(&empty);
        Self::from_sections(prefs, setup)
    }

    /// Standalone preferences document with every section at the top level.
    pub fn from_prefs_value(raw: &Value) -> Self {
        match raw.as_object() {
            Some(obj) => Self::from_sections(obj, obj),
            None => Self::default(),
        }
    }

    /// Loads a standalone preferences file. A missing file means defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PrefsError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no event preferences file, using defaults");
            return Ok(Self::default());
        }
        Ok(Self::from_prefs_value(&read_json(path)?))
    }

    pub fn load_config(path: impl AsRef<Path>) -> Result<Self, PrefsError> {
        Ok(Self::from_config(&read_json(path.as_ref())?))
    }

    fn from_sections(prefs: &Map<String, Value>, setup: &Map<String, Value>) -> Self {
        let mut out = UserPrefs::default();

        if let Some(overrides) = prefs.get("overrides").and_then(Value::as_object) {
            for (key, value) in overrides {
                match coerce_pick(value) {
                    Some(pick) if pick >= 1 => {
                        out = out.with_override(key.as_str(), clamp_pick(pick));
                    }
                    _ => tracing::debug!(key = %key, "ignoring override without a positive pick"),
                }
            }
        }

        match prefs.get("patterns") {
            Some(Value::Object(map)) => {
                for (pattern, pick) in map {
                    if let Some(pick) = coerce_pick(pick) {
                        out = out.with_pattern(pattern, clamp_pick(pick));
                    }
                }
            }
            Some(Value::Array(items)) => {
                for item in items.iter().filter_map(Value::as_object) {
                    let Some(pattern) = non_empty_str(item, "pattern") else {
                        continue;
                    };
                    let pick = item.get("pick").and_then(coerce_pick).unwrap_or(1);
                    out = out.with_pattern(pattern, clamp_pick(pick));
                }
            }
            _ => {}
        }

        if let Some(defaults) = prefs.get("defaults").and_then(Value::as_object) {
            for record_type in RecordType::ALL {
                let pick = defaults
                    .get(record_type.as_str())
                    .and_then(coerce_pick)
                    .filter(|pick| *pick != 0)
                    .unwrap_or(1);
                out = out.with_type_default(record_type, clamp_pick(pick));
            }
        }

        out = out
            .with_avoid_energy_overflow(coerce_bool(
                either(prefs, "avoidEnergyOverflow", "avoid_energy_overflow"),
                true,
            ))
            .with_reward_priority(normalize_reward_priority(either(
                prefs,
                "rewardPriority",
                "reward_priority",
            )));

        if let Some(supports) = setup.get("supports").and_then(Value::as_array) {
            for entry in supports.iter().filter_map(Value::as_object) {
                let (Some(name), Some(rarity), Some(attribute)) = (
                    non_empty_str(entry, "name"),
                    non_empty_str(entry, "rarity"),
                    non_empty_str(entry, "attribute"),
                ) else {
                    continue;
                };
                out = out.with_entity(EntityKey::support(name, attribute, rarity), entity_prefs(entry));
            }
        }

        if let Some(entry) = setup.get("scenario").and_then(Value::as_object) {
            if let Some(name) = non_empty_str(entry, "name") {
                out = out.with_entity(EntityKey::scenario(name), entity_prefs(entry));
            }
        }

        if let Some(entry) = setup.get("trainee").and_then(Value::as_object) {
            if let Some(name) = non_empty_str(entry, "name") {
                out = out
                    .with_preferred_trainee(name)
                    .with_entity(EntityKey::trainee(name), entity_prefs(entry));
            }
        }

        out
    }
}

fn read_json(path: &Path) -> Result<Value, PrefsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PrefsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| PrefsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
