mod record;

use std::path::{Path, PathBuf};

pub use record::{options_from_keyed, record_key, EventRecord, Outcome, RecordType};

use crate::rewards::{extract_reward_categories, max_positive_energy, RewardCategory};
use crate::text::normalize_text;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("missing catalog {0}; run build-catalog first")]
    Missing(PathBuf),

    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Vec<EventRecord>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CatalogError::Missing(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<EventRecord> =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), records = records.len(), "catalog loaded");
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<EventRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_key_step(&self, key_step: &str) -> Option<&EventRecord> {
        self.records.iter().find(|rec| rec.key_step == key_step)
    }

    fn next_chain_pool(
        &self,
        support_name: &str,
        next_step: u32,
        attribute: Option<&str>,
        rarity: Option<&str>,
    ) -> Option<Vec<&EventRecord>> {
        let name_norm = normalize_text(support_name);
        if name_norm.is_empty() {
            return None;
        }
        let attr_norm = normalize_text(attribute.unwrap_or(""));
        let rar_norm = normalize_text(rarity.unwrap_or(""));

        let pool: Vec<&EventRecord> = self
            .records
            .iter()
            .filter(|rec| {
                rec.record_type == RecordType::Support
                    && normalize_text(&rec.name) == name_norm
                    && (attr_norm.is_empty() || normalize_text(&rec.attribute) == attr_norm)
                    && (rar_norm.is_empty() || normalize_text(&rec.rarity) == rar_norm)
                    && rec.step() == next_step
            })
            .collect();
        if pool.is_empty() {
            return None;
        }
        let dated: Vec<&EventRecord> = pool
            .iter()
            .copied()
            .filter(|rec| {
                rec.event_kind
                    .as_deref()
                    .map(|kind| matches!(kind.trim().to_ascii_lowercase().as_str(), "date" | "chain"))
                    .unwrap_or(false)
            })
            .collect();
        Some(if dated.is_empty() { pool } else { dated })
    }

    /// Whether the given support's chain event at `next_step` can restore
    /// energy. `None` when the catalog has no such event.
    pub fn next_chain_has_energy(
        &self,
        support_name: &str,
        next_step: u32,
        attribute: Option<&str>,
        rarity: Option<&str>,
    ) -> Option<bool> {
        let pool = self.next_chain_pool(support_name, next_step, attribute, rarity)?;
        Some(pool.iter().any(|rec| {
            rec.options.iter().any(|outcomes| {
                extract_reward_categories(outcomes).contains(&RewardCategory::Energy)
                    || max_positive_energy(outcomes) > 0
            })
        }))
    }

    pub fn next_chain_max_energy(
        &self,
        support_name: &str,
        next_step: u32,
        attribute: Option<&str>,
        rarity: Option<&str>,
    ) -> Option<i64> {
        let pool = self.next_chain_pool(support_name, next_step, attribute, rarity)?;
        let max_gain = pool
            .iter()
            .flat_map(|rec| rec.options.iter())
            .map(|outcomes| max_positive_energy(outcomes))
            .max()
            .unwrap_or(0);
        Some(max_gain)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    fn outcome(value: Value) -> Outcome {
        value.as_object().cloned().unwrap_or_else(Map::new)
    }

    fn support(event: &str, step: u32, kind: Option<&str>, energy: i64) -> EventRecord {
        let mut rec = EventRecord::new(
            RecordType::Support,
            "Kitasan Black",
            "SSR",
            "SPD",
            event,
            Some(step),
            vec![
                vec![outcome(json!({"energy": energy}))],
                vec![outcome(json!({"speed": 5}))],
            ],
        );
        rec.event_kind = kind.map(str::to_string);
        rec
    }

    #[test]
    fn load_reports_missing_and_malformed_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("nope.json");
        assert!(matches!(Catalog::load(&missing), Err(CatalogError::Missing(_))));

        let broken = temp.path().join("broken.json");
        std::fs::write(&broken, "[{")?;
        assert!(matches!(Catalog::load(&broken), Err(CatalogError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn load_reads_artifact_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("catalog.json");
        let records = vec![support("Chat", 1, None, 0), support("Walk", 2, Some("chain"), 10)];
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)?;

        let catalog = Catalog::load(&path)?;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.records()[1].event_name, "Walk");
        assert!(catalog
            .by_key_step("support/Kitasan Black/SPD/SSR/Walk#s2")
            .is_some());
        Ok(())
    }

    #[test]
    fn next_chain_queries_prefer_chain_kinds() {
        let catalog = Catalog::from_records(vec![
            support("Random Thing", 2, Some("random"), 40),
            support("Chain Two", 2, Some("chain"), 0),
            support("Chain Three", 3, Some("date"), 25),
        ]);
        assert_eq!(catalog.next_chain_has_energy("kitasan black", 2, None, None), Some(false));
        assert_eq!(catalog.next_chain_max_energy("Kitasan Black", 3, Some("spd"), Some("ssr")), Some(25));
        assert_eq!(catalog.next_chain_has_energy("Kitasan Black", 3, None, None), Some(true));
        assert_eq!(catalog.next_chain_has_energy("Kitasan Black", 4, None, None), None);
        assert_eq!(catalog.next_chain_max_energy("", 2, None, None), None);
        assert_eq!(catalog.next_chain_max_energy("Kitasan Black", 2, Some("pwr"), None), None);
    }
}
