mod alias;
mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use indexmap::IndexMap;

pub use config::{active_preset, coerce_bool};

use crate::catalog::{EventRecord, RecordType};
use crate::rewards::{RewardCategory, DEFAULT_REWARD_PRIORITY};
use crate::text::normalize_text;

#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("failed to read preferences {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed preferences {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// What the decision policy asks of the operator's preferences.
pub trait EventPolicy: Send + Sync {
    /// 1-based option to pick for `rec`. Never below 1.
    fn pick_for(&self, rec: &EventRecord) -> u32;

    fn should_avoid_energy(&self, _rec: &EventRecord) -> bool {
        true
    }

    fn reward_priority_for(&self, _rec: &EventRecord) -> Vec<RewardCategory> {
        DEFAULT_REWARD_PRIORITY.to_vec()
    }

    fn preferred_trainee_name(&self) -> Option<&str> {
        None
    }
}

/// Identity of a deck entry that can carry its own energy policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// `(name, ATTRIBUTE, RARITY)`
    Support(String, String, String),
    Scenario(String),
    Trainee(String),
}

impl EntityKey {
    pub fn support(name: &str, attribute: &str, rarity: &str) -> Self {
        let upper = |value: &str| {
            let value = value.trim();
            if value.is_empty() {
                "NONE".to_string()
            } else {
                value.to_uppercase()
            }
        };
        EntityKey::Support(name.trim().to_string(), upper(attribute), upper(rarity))
    }

    pub fn scenario(name: &str) -> Self {
        EntityKey::Scenario(normalize_text(name))
    }

    pub fn trainee(name: &str) -> Self {
        EntityKey::Trainee(normalize_text(name))
    }

    pub fn for_record(rec: &EventRecord) -> Self {
        match rec.record_type {
            RecordType::Support => Self::support(&rec.name, &rec.attribute, &rec.rarity),
            RecordType::Scenario => Self::scenario(&rec.name),
            RecordType::Trainee => Self::trainee(&rec.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityPrefs {
    pub avoid_energy_overflow: bool,
    pub reward_priority: Option<Vec<RewardCategory>>,
}

#[derive(Debug, Clone)]
struct PickPattern {
    raw: String,
    compiled: Option<glob::Pattern>,
    pick: u32,
}

impl PickPattern {
    fn new(raw: &str, pick: u32) -> Self {
        let compiled = match glob::Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::debug!(pattern = raw, error = %err, "pattern is not a valid glob, matching literally");
                None
            }
        };
        Self {
            raw: raw.to_string(),
            compiled,
            pick,
        }
    }

    fn matches(&self, key: &str) -> bool {
        match &self.compiled {
            Some(pattern) => pattern.matches(key),
            None => self.raw == key,
        }
    }
}

/// Operator preferences for event choices. Immutable once built; the
/// trainee alias table is derived from the overrides on first use.
#[derive(Debug, Clone)]
pub struct UserPrefs {
    overrides: IndexMap<String, u32>,
    alias_overrides: OnceLock<IndexMap<String, u32>>,
    patterns: Vec<PickPattern>,
    default_by_type: HashMap<RecordType, u32>,
    avoid_energy_overflow: bool,
    reward_priority: Vec<RewardCategory>,
    entities: HashMap<EntityKey, EntityPrefs>,
    preferred_trainee_name: Option<String>,
}

impl Default for UserPrefs {
    fn default() -> Self {
        Self {
            overrides: IndexMap::new(),
            alias_overrides: OnceLock::new(),
            patterns: Vec::new(),
            default_by_type: RecordType::ALL.iter().map(|kind| (*kind, 1)).collect(),
            avoid_energy_overflow: true,
            reward_priority: DEFAULT_REWARD_PRIORITY.to_vec(),
            entities: HashMap::new(),
            preferred_trainee_name: None,
        }
    }
}

impl UserPrefs {
    /// Adds an exact override; picks below 1 are ignored.
    pub fn with_override(mut self, key: impl Into<String>, pick: u32) -> Self {
        if pick >= 1 {
            self.overrides.insert(key.into(), pick);
            self.alias_overrides = OnceLock::new();
        }
        self
    }

    /// Appends a glob pattern; patterns are tried in insertion order.
    pub fn with_pattern(mut self, pattern: &str, pick: u32) -> Self {
        self.patterns.push(PickPattern::new(pattern, pick.max(1)));
        self
    }

    pub fn with_type_default(mut self, record_type: RecordType, pick: u32) -> Self {
        self.default_by_type.insert(record_type, pick.max(1));
        self
    }

    pub fn with_avoid_energy_overflow(mut self, enabled: bool) -> Self {
        self.avoid_energy_overflow = enabled;
        self
    }

    pub fn with_reward_priority(mut self, priority: Vec<RewardCategory>) -> Self {
        self.reward_priority = if priority.is_empty() {
            DEFAULT_REWARD_PRIORITY.to_vec()
        } else {
            priority
        };
        self
    }

    pub fn with_entity(mut self, key: EntityKey, prefs: EntityPrefs) -> Self {
        self.entities.insert(key, prefs);
        self
    }

    pub fn with_preferred_trainee(mut self, name: &str) -> Self {
        let name = name.trim();
        self.preferred_trainee_name = (!name.is_empty()).then(|| name.to_string());
        self
    }

    pub fn overrides(&self) -> &IndexMap<String, u32> {
        &self.overrides
    }

    pub fn alias_overrides(&self) -> &IndexMap<String, u32> {
        self.alias_overrides
            .get_or_init(|| alias::build_alias_overrides(&self.overrides))
    }

    pub fn patterns(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.patterns.iter().map(|p| (p.raw.as_str(), p.pick))
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityPrefs> {
        self.entities.get(key)
    }

    pub fn type_default(&self, record_type: RecordType) -> u32 {
        self.default_by_type
            .get(&record_type)
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    /// Resolution order: exact override (step key, then plain key), trainee
    /// aliases, trainee-specific overrides for the shared trainee record,
    /// patterns, the catalog default, then the per-type default.
    pub fn pick_for(&self, rec: &EventRecord) -> u32 {
        if let Some(pick) = lookup(&self.overrides, rec) {
            return pick;
        }
        if let Some(pick) = lookup(self.alias_overrides(), rec) {
            return pick;
        }
        if rec.record_type == RecordType::Trainee && normalize_text(&rec.name) == "general" {
            if let Some(pick) = alias::match_specific_trainee_override(&self.overrides, rec) {
                return pick.max(1);
            }
        }
        for pattern in &self.patterns {
            if pattern.matches(&rec.key_step) || pattern.matches(&rec.key) {
                return pattern.pick.max(1);
            }
        }
        if let Some(default) = rec.default_preference {
            return default.max(1);
        }
        self.type_default(rec.record_type)
    }
}

fn lookup(table: &IndexMap<String, u32>, rec: &EventRecord) -> Option<u32> {
    table
        .get(&rec.key_step)
        .or_else(|| table.get(&rec.key))
        .map(|pick| (*pick).max(1))
}

impl EventPolicy for UserPrefs {
    fn pick_for(&self, rec: &EventRecord) -> u32 {
        UserPrefs::pick_for(self, rec)
    }

    fn should_avoid_energy(&self, rec: &EventRecord) -> bool {
        self.entities
            .get(&EntityKey::for_record(rec))
            .map(|entity| entity.avoid_energy_overflow)
            .unwrap_or(self.avoid_energy_overflow)
    }

    fn reward_priority_for(&self, rec: &EventRecord) -> Vec<RewardCategory> {
        self.entities
            .get(&EntityKey::for_record(rec))
            .and_then(|entity| entity.reward_priority.clone())
            .filter(|priority| !priority.is_empty())
            .unwrap_or_else(|| self.reward_priority.clone())
    }

    fn preferred_trainee_name(&self) -> Option<&str> {
        self.preferred_trainee_name.as_deref()
    }
}
