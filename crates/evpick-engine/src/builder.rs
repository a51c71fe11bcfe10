use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use evpick_contracts::catalog::options_from_keyed;
use evpick_contracts::rewards::OutcomeWeights;
use evpick_contracts::text::normalize_text;
use evpick_contracts::{EventRecord, RecordType};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::imaging::{mean_hash, phash_file};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];
const TRAINEE_ICON_DIR: &str = "trainee_icon_event";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub records: usize,
    pub dropped_events: usize,
    pub parents_without_art: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default)]
struct ArtEntry {
    image_path: Option<String>,
    phash: Option<u64>,
    variants: Vec<String>,
}

/// Flattens the scraped event dataset into catalog rows, attaching
/// representative portrait art and a worst-case default option.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    assets_dir: PathBuf,
    weights: OutcomeWeights,
}

impl CatalogBuilder {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            weights: OutcomeWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: OutcomeWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn build_file(&self, dataset: &Path, out: &Path) -> Result<BuildReport> {
        let raw = fs::read_to_string(dataset)
            .with_context(|| format!("failed to read dataset {}", dataset.display()))?;
        let root: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse dataset {}", dataset.display()))?;

        let (records, mut report) = self.build(&root)?;
        let artifact = serde_json::to_string_pretty(&records)?;
        report.fingerprint = sha256_hex(artifact.as_bytes());

        if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(out, artifact).with_context(|| format!("failed to write {}", out.display()))?;
        tracing::info!(
            out = %out.display(),
            records = report.records,
            dropped = report.dropped_events,
            fingerprint = %report.fingerprint,
            "catalog written"
        );
        Ok(report)
    }

    /// Builds records from a parsed dataset. The fingerprint of the returned
    /// report is left empty; `build_file` fills it from the serialised artifact.
    pub fn build(&self, root: &Value) -> Result<(Vec<EventRecord>, BuildReport)> {
        let parents = root
            .as_array()
            .context("event dataset must be a JSON array")?;

        let mut art: HashMap<(RecordType, String, String, String), ArtEntry> = HashMap::new();
        let mut parents_without_art = 0usize;
        let mut records = Vec::new();
        let mut dropped_events = 0usize;

        for parent in parents.iter().filter_map(Value::as_object) {
            let Some(record_type) = parent
                .get("type")
                .and_then(Value::as_str)
                .and_then(RecordType::parse)
            else {
                tracing::warn!(name = ?parent.get("name"), "skipping dataset entry with unknown type");
                continue;
            };
            let name = text_field(parent, "name", "");
            let rarity = text_field(parent, "rarity", "None");
            let attribute = text_field(parent, "attribute", "None");

            let identity = (record_type, name.clone(), rarity.clone(), attribute.clone());
            if !art.contains_key(&identity) {
                let entry = self.resolve_art(record_type, &name, &rarity, &attribute);
                if entry.image_path.is_none() {
                    parents_without_art += 1;
                    tracing::debug!(kind = %record_type, name = %name, "no portrait art found");
                }
                art.insert(identity.clone(), entry);
            }
            let entry = art.get(&identity).cloned().unwrap_or_default();

            let events = parent
                .get("choice_events")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for event in events.iter().filter_map(Value::as_object) {
                let Some(raw_options) = keyed_options(event.get("options")) else {
                    dropped_events += 1;
                    continue;
                };
                let options = options_from_keyed(&raw_options);
                if options.len() <= 1 {
                    dropped_events += 1;
                    continue;
                }
                let chain_step = event
                    .get("chain_step")
                    .and_then(Value::as_u64)
                    .and_then(|step| u32::try_from(step).ok());

                let mut rec = EventRecord::new(
                    record_type,
                    &name,
                    &rarity,
                    &attribute,
                    &text_field(event, "name", ""),
                    chain_step,
                    options,
                );
                rec.default_preference = Some(self.weights.choose_default_preference(&rec.options));
                rec.event_kind = event
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                rec.image_path = entry.image_path.clone();
                rec.phash64 = entry.phash;
                rec.image_variants = if entry.variants.is_empty() {
                    entry.image_path.iter().cloned().collect()
                } else {
                    entry.variants.clone()
                };
                records.push(rec);
            }
        }

        let report = BuildReport {
            records: records.len(),
            dropped_events,
            parents_without_art,
            fingerprint: String::new(),
        };
        Ok((records, report))
    }

    fn resolve_art(&self, record_type: RecordType, name: &str, rarity: &str, attribute: &str) -> ArtEntry {
        if record_type == RecordType::Trainee && normalize_text(name) != "general" {
            let variants = self.trainee_variants(name);
            let hashes: Vec<u64> = variants
                .iter()
                .filter_map(|path| phash_file(path).ok())
                .collect();
            let image_path = variants
                .first()
                .cloned()
                .or_else(|| self.find_event_image(TRAINEE_ICON_DIR, name, rarity, attribute));
            let phash = mean_hash(&hashes)
                .or_else(|| image_path.as_deref().and_then(|path| phash_file(path).ok()));
            return ArtEntry {
                image_path: image_path.map(|path| path.to_string_lossy().to_string()),
                phash,
                variants: variants
                    .iter()
                    .map(|path| path.to_string_lossy().to_string())
                    .collect(),
            };
        }

        let image_path = self.find_event_image(record_type.as_str(), name, rarity, attribute);
        let phash = image_path.as_deref().and_then(|path| match phash_file(path) {
            Ok(hash) => Some(hash),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to hash portrait");
                None
            }
        });
        ArtEntry {
            image_path: image_path.map(|path| path.to_string_lossy().to_string()),
            phash,
            variants: Vec::new(),
        }
    }

    /// Representative image under `<assets>/<dir>/`, trying
    /// `<name>_<ATTR>_<rarity>`, `<name>_<ATTR>`, `<name>_<rarity>` and
    /// `<name>` with each image extension. Unset dimensions are skipped.
    pub fn find_event_image(&self, dir: &str, name: &str, rarity: &str, attribute: &str) -> Option<PathBuf> {
        if dir == TRAINEE_ICON_DIR {
            if let Some(first) = self.trainee_variants(name).into_iter().next() {
                return Some(first);
            }
        }
        let folder = self.assets_dir.join(dir);
        let unset = |value: &str| matches!(value.trim().to_ascii_lowercase().as_str(), "" | "none" | "null");
        let attr = attribute.trim();
        let rar = rarity.trim();

        let mut candidates = Vec::new();
        if dir == RecordType::Trainee.as_str() {
            candidates.push(name.to_string());
        }
        if !unset(attr) && !unset(rar) {
            candidates.push(format!("{name}_{}_{rar}", attr.to_uppercase()));
        }
        if !unset(attr) {
            candidates.push(format!("{name}_{}", attr.to_uppercase()));
        }
        if !unset(rar) {
            candidates.push(format!("{name}_{rar}"));
        }
        candidates.push(name.to_string());

        candidates.iter().find_map(|base| {
            IMAGE_EXTENSIONS
                .iter()
                .map(|ext| folder.join(format!("{base}.{ext}")))
                .find(|path| path.is_file())
        })
    }

    /// Every portrait variant of a trainee: files inside `<name>/`, then
    /// `<name>.<ext>`, then `<name>_*.<ext>`, without duplicates.
    pub fn trainee_variants(&self, name: &str) -> Vec<PathBuf> {
        let base = self.assets_dir.join(TRAINEE_ICON_DIR);
        let escaped_dir = glob::Pattern::escape(&base.to_string_lossy());
        let escaped_name = glob::Pattern::escape(name);
        let mut candidates: Vec<PathBuf> = Vec::new();

        let variant_dir = base.join(name);
        if variant_dir.is_dir() {
            for ext in IMAGE_EXTENSIONS {
                candidates.extend(sorted_glob(&format!("{escaped_dir}/{escaped_name}/*.{ext}")));
            }
        }
        for ext in IMAGE_EXTENSIONS {
            let direct = base.join(format!("{name}.{ext}"));
            if direct.is_file() {
                candidates.push(direct);
            }
        }
        for ext in IMAGE_EXTENSIONS {
            candidates.extend(sorted_glob(&format!("{escaped_dir}/{escaped_name}_*.{ext}")));
        }

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|path| seen.insert(fs::canonicalize(path).unwrap_or_else(|_| path.clone())))
            .collect()
    }
}

fn sorted_glob(pattern: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect(),
        Err(err) => {
            tracing::debug!(pattern, error = %err, "bad asset pattern");
            Vec::new()
        }
    };
    paths.sort();
    paths
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn text_field(obj: &Map<String, Value>, field: &str, default: &str) -> String {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Options as a `"1" -> outcomes` map. A list is numbered from 1.
fn keyed_options(raw: Option<&Value>) -> Option<Map<String, Value>> {
    match raw? {
        Value::Object(map) => Some(map.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .enumerate()
                .map(|(idx, item)| ((idx + 1).to_string(), item.clone()))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use evpick_contracts::Catalog;
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    fn write_png(path: &Path, seed: u8) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        RgbImage::from_fn(24, 24, |x, y| Rgb([seed.wrapping_add((x * 9) as u8), (y * 9) as u8, seed]))
            .save(path)?;
        Ok(())
    }

    fn dataset() -> Value {
        json!([
            {
                "type": "support",
                "name": "Kitasan Black",
                "rarity": "SSR",
                "attribute": "spd",
                "choice_events": [
                    {"name": "Paying It Forward", "type": "chain", "chain_step": 2, "options": {
                        "1": [{"energy": 30}, {"energy": -10}],
                        "2": [{"speed": 10}],
                    }},
                    {"name": "Solo", "options": {"1": [{"speed": 5}]}},
                ]
            },
            {
                "type": "trainee",
                "name": "Special Week",
                "rarity": "None",
                "attribute": "None",
                "choice_events": [
                    {"name": "Dream Big", "options": [[{"guts": 5}], [{"guts": 10}]]},
                ]
            },
            {"type": "mystery", "name": "?"},
        ])
    }

    #[test]
    fn build_flattens_events_and_attaches_art() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let assets = temp.path().join("assets");
        write_png(&assets.join("support").join("Kitasan Black_SPD_SSR.png"), 10)?;
        write_png(&assets.join(TRAINEE_ICON_DIR).join("Special Week").join("a.png"), 40)?;
        write_png(&assets.join(TRAINEE_ICON_DIR).join("Special Week_alt.png"), 90)?;

        let builder = CatalogBuilder::new(&assets);
        let (records, report) = builder.build(&dataset())?;
        assert_eq!(records.len(), 2);
        assert_eq!(report.dropped_events, 1);
        assert_eq!(report.parents_without_art, 0);

        let support = &records[0];
        assert_eq!(support.key_step, "support/Kitasan Black/spd/SSR/Paying It Forward#s2");
        assert_eq!(support.default_preference, Some(2));
        assert_eq!(support.event_kind.as_deref(), Some("chain"));
        assert_eq!(support.image_variants.len(), 1);
        assert!(support.phash64.is_some());

        let trainee = &records[1];
        assert_eq!(trainee.image_variants.len(), 2);
        assert!(trainee.image_variants[0].ends_with("a.png"));
        assert_eq!(trainee.default_preference, Some(2));
        assert_eq!(trainee.option_count(), 2);
        Ok(())
    }

    #[test]
    fn build_file_is_idempotent_and_loadable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dataset_path = temp.path().join("events.json");
        fs::write(&dataset_path, serde_json::to_string(&dataset())?)?;
        let out = temp.path().join("out").join("event_catalog.json");

        let builder = CatalogBuilder::new(temp.path().join("assets"));
        let first = builder.build_file(&dataset_path, &out)?;
        let second = builder.build_file(&dataset_path, &out)?;
        assert_eq!(first, second);
        assert_eq!(first.fingerprint.len(), 64);
        assert_eq!(first.parents_without_art, 2);

        let catalog = Catalog::load(&out)?;
        assert_eq!(catalog.len(), 2);
        assert!(catalog.records().iter().all(|rec| rec.option_count() >= 2));
        Ok(())
    }

    #[test]
    fn option_count_follows_usable_numbered_options() -> anyhow::Result<()> {
        let root = json!([{
            "type": "support",
            "name": "Vodka",
            "rarity": "SSR",
            "attribute": "spd",
            "choice_events": [
                {"name": "Odd", "options": {"1": [{"speed": 5}], "x": [{"guts": 5}]}},
                {"name": "Gap", "options": {"1": [{"speed": 5}], "3": [{"guts": 5}]}},
                {"name": "Huge", "options": {"1": [{"speed": 5}], "4000000000": [{"wit": 5}]}},
            ]
        }]);
        let temp = tempfile::tempdir()?;
        let (records, report) = CatalogBuilder::new(temp.path()).build(&root)?;
        assert_eq!(report.dropped_events, 1);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|rec| rec.option_count() == 2));

        let gap = &records[0];
        assert_eq!(gap.event_name, "Gap");
        assert_eq!(gap.outcomes(2)[0]["guts"], json!(5));
        assert_eq!(records[1].outcomes(2)[0]["wit"], json!(5));
        Ok(())
    }

    #[test]
    fn image_lookup_prefers_most_specific_name() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let assets = temp.path();
        write_png(&assets.join("support").join("Vodka.jpg"), 1)?;
        write_png(&assets.join("support").join("Vodka_PWR.png"), 2)?;

        let builder = CatalogBuilder::new(assets);
        let found = builder.find_event_image("support", "Vodka", "SR", "pwr");
        assert_eq!(found, Some(assets.join("support").join("Vodka_PWR.png")));
        let fallback = builder.find_event_image("support", "Vodka", "None", "None");
        assert_eq!(fallback, Some(assets.join("support").join("Vodka.jpg")));
        assert_eq!(builder.find_event_image("scenario", "URA", "None", "None"), None);
        Ok(())
    }
}
