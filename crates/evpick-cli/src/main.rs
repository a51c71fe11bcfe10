use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evpick_contracts::trace::DecisionLog;
use evpick_contracts::{
    BoundingBox, Catalog, DecisionTuning, Detection, EventPolicy, EventRecord, RecordType,
    ScoreWeights, UserPrefs,
};
use evpick_engine::{CatalogBuilder, Controller, Detector, EventFlow, OcrEngine, Query, Retriever};
use image::RgbImage;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evpick", version, about = "Event decision engine tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Flatten a scraped event dataset into a catalog artifact.
    BuildCatalog(BuildCatalogArgs),
    /// Rank catalog records against a title and optional portrait.
    Query(QueryArgs),
    /// Resolve the configured option for a catalog key.
    Pick(PickArgs),
    /// Run the decision policy on a recorded event screen.
    Replay(ReplayArgs),
}

#[derive(Debug, Parser)]
struct BuildCatalogArgs {
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    assets: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct PrefsArgs {
    /// Standalone preferences JSON.
    #[arg(long)]
    prefs: Option<PathBuf>,
    /// Application config; its active preset wins over `--prefs`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct QueryArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long)]
    type_hint: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    rarity: Option<String>,
    #[arg(long)]
    attribute: Option<String>,
    #[arg(long)]
    chain_step: Option<u32>,
    #[arg(long)]
    portrait: Option<PathBuf>,
    #[arg(long)]
    preferred_trainee: Option<String>,
    #[arg(long, default_value_t = 3)]
    top_k: usize,
    #[arg(long, default_value_t = 0.0)]
    min_score: f64,
    #[arg(long)]
    tuning: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PickArgs {
    #[arg(long)]
    catalog: PathBuf,
    /// Record key, with or without the `#s<step>` suffix.
    #[arg(long)]
    key: String,
    #[command(flatten)]
    prefs: PrefsArgs,
}

#[derive(Debug, Parser)]
struct ReplayArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    frame: PathBuf,
    /// JSON list of detections on the frame.
    #[arg(long)]
    detections: PathBuf,
    /// JSON list of OCR answers, consumed in call order.
    #[arg(long)]
    ocr: Option<PathBuf>,
    /// Detections returned when the engine recaptures the screen.
    #[arg(long)]
    recapture: Option<PathBuf>,
    #[arg(long)]
    energy: Option<i64>,
    #[arg(long, default_value_t = 100)]
    max_energy: i64,
    #[command(flatten)]
    prefs: PrefsArgs,
    #[arg(long)]
    tuning: Option<PathBuf>,
    /// Append the decision to this JSONL trace.
    #[arg(long)]
    trace: Option<PathBuf>,
}

/// Optional overrides for retrieval weights and decision thresholds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct TuningFile {
    weights: ScoreWeights,
    decision: DecisionTuning,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("evpick error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "starting");
    let output = match cli.command {
        Command::BuildCatalog(args) => run_build_catalog(args)?,
        Command::Query(args) => run_query(args)?,
        Command::Pick(args) => run_pick(args)?,
        Command::Replay(args) => run_replay(args)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_build_catalog(args: BuildCatalogArgs) -> Result<Value> {
    let report = CatalogBuilder::new(&args.assets).build_file(&args.dataset, &args.out)?;
    Ok(serde_json::to_value(report)?)
}

fn run_query(args: QueryArgs) -> Result<Value> {
    let catalog = Catalog::load(&args.catalog)?;
    let tuning = load_tuning(args.tuning.as_deref())?;
    let retriever = Retriever::new(tuning.weights);

    let mut query = Query::new(args.title);
    if let Some(raw) = args.type_hint.as_deref() {
        let Some(record_type) = RecordType::parse(raw) else {
            bail!("unknown record type {raw:?}; expected support, trainee or scenario");
        };
        query.type_hint = Some(record_type);
    }
    query.name_hint = args.name;
    query.rarity_hint = args.rarity;
    query.attribute_hint = args.attribute;
    query.chain_step_hint = args.chain_step;
    query.preferred_trainee_name = args.preferred_trainee;
    if let Some(path) = &args.portrait {
        query.portrait_image = Some(load_frame(path)?);
        query.portrait_path = Some(path.clone());
    }

    let results = retriever.retrieve_best(&catalog, &query, args.top_k, args.min_score);
    let ranked: Vec<Value> = results
        .iter()
        .map(|result| {
            json!({
                "key_step": result.rec.key_step,
                "score": result.score,
                "text_sim": result.text_sim,
                "img_sim": result.img_sim,
                "hint_bonus": result.hint_bonus,
            })
        })
        .collect();
    Ok(json!({ "results": ranked }))
}

fn run_pick(args: PickArgs) -> Result<Value> {
    let catalog = Catalog::load(&args.catalog)?;
    let prefs = load_prefs(&args.prefs)?;
    let rec = find_record(&catalog, &args.key)
        .with_context(|| format!("no catalog record for {}", args.key))?;

    let priority: Vec<&str> = prefs
        .reward_priority_for(rec)
        .into_iter()
        .map(|category| category.as_str())
        .collect();
    Ok(json!({
        "key_step": rec.key_step,
        "pick": prefs.pick_for(rec),
        "options": rec.option_count(),
        "avoid_energy_overflow": prefs.should_avoid_energy(rec),
        "reward_priority": priority,
    }))
}

fn run_replay(args: ReplayArgs) -> Result<Value> {
    let catalog = Catalog::load(&args.catalog)?;
    let prefs = load_prefs(&args.prefs)?;
    let tuning = load_tuning(args.tuning.as_deref())?;
    let frame = load_frame(&args.frame)?;
    let detections = load_detections(&args.detections)?;
    let recapture = match &args.recapture {
        Some(path) => Some(load_detections(path)?),
        None => None,
    };
    let answers: Vec<String> = match &args.ocr {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let clicks = ClickLog::default();
    let mut flow = EventFlow::new(
        Arc::new(catalog),
        Arc::new(prefs),
        Box::new(RecordedScreen {
            frame: frame.clone(),
            recapture,
        }),
        Box::new(TranscriptOcr::new(answers)),
        Box::new(clicks.clone()),
    )
    .with_retriever(Retriever::new(tuning.weights))
    .with_tuning(tuning.decision);
    if let Some(path) = &args.trace {
        flow = flow.with_trace(DecisionLog::new(path));
    }

    let decision = flow.process_event_screen(&frame, &detections, args.energy, args.max_energy);
    let clicked: Vec<Value> = clicks
        .taken()
        .into_iter()
        .map(|(bbox, count)| json!({"bbox": bbox, "clicks": count}))
        .collect();
    Ok(json!({ "decision": decision, "clicks": clicked }))
}

fn find_record<'a>(catalog: &'a Catalog, key: &str) -> Option<&'a EventRecord> {
    catalog
        .by_key_step(key)
        .or_else(|| catalog.records().iter().find(|rec| rec.key == key))
}

fn load_prefs(args: &PrefsArgs) -> Result<UserPrefs> {
    if let Some(path) = &args.config {
        return Ok(UserPrefs::load_config(path)?);
    }
    match &args.prefs {
        Some(path) => Ok(UserPrefs::load(path)?),
        None => Ok(UserPrefs::default()),
    }
}

fn load_tuning(path: Option<&Path>) -> Result<TuningFile> {
    match path {
        Some(path) => read_json(path),
        None => Ok(TuningFile::default()),
    }
}

fn load_frame(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read frame ({})", path.display()))?
        .to_rgb8())
}

fn load_detections(path: &Path) -> Result<Vec<Detection>> {
    read_json(path)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Answers OCR requests from a recorded transcript, then with empty text.
struct TranscriptOcr {
    answers: Mutex<VecDeque<String>>,
}

impl TranscriptOcr {
    fn new(answers: Vec<String>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }
}

impl OcrEngine for TranscriptOcr {
    fn text(&self, _image: &RgbImage) -> Result<String> {
        let mut answers = self
            .answers
            .lock()
            .map_err(|_| anyhow::anyhow!("ocr transcript lock poisoned"))?;
        Ok(answers.pop_front().unwrap_or_default())
    }
}

struct RecordedScreen {
    frame: RgbImage,
    recapture: Option<Vec<Detection>>,
}

impl Detector for RecordedScreen {
    fn recognize(&mut self) -> Result<(RgbImage, Vec<Detection>)> {
        match self.recapture.take() {
            Some(detections) => Ok((self.frame.clone(), detections)),
            None => bail!("no recapture recorded"),
        }
    }
}

#[derive(Clone, Default)]
struct ClickLog(Arc<Mutex<Vec<(BoundingBox, u32)>>>);

impl ClickLog {
    fn taken(&self) -> Vec<(BoundingBox, u32)> {
        self.0.lock().map(|clicks| clicks.clone()).unwrap_or_default()
    }
}

impl Controller for ClickLog {
    fn click(&mut self, bbox: &BoundingBox, clicks: u32) -> Result<()> {
        let mut taken = self
            .0
            .lock()
            .map_err(|_| anyhow::anyhow!("click log lock poisoned"))?;
        taken.push((*bbox, clicks));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_json(path: &Path, value: &Value) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    fn catalog_fixture(dir: &Path) -> Result<PathBuf> {
        let dataset = dir.join("events.json");
        write_json(
            &dataset,
            &json!([{
                "type": "support",
                "name": "Kitasan Black",
                "rarity": "SSR",
                "attribute": "SPD",
                "choice_events": [{
                    "name": "Paying It Forward",
                    "type": "random",
                    "options": {
                        "1": [{"energy": -10}],
                        "2": [{"speed": 10}, {"skill_pts": 15}],
                    }
                }]
            }]),
        )?;
        let out = dir.join("catalog.json");
        run_build_catalog(BuildCatalogArgs {
            dataset,
            assets: dir.join("assets"),
            out: out.clone(),
        })?;
        Ok(out)
    }

    #[test]
    fn transcript_ocr_answers_in_order() -> Result<()> {
        let ocr = TranscriptOcr::new(vec!["first".into(), "second".into()]);
        let image = RgbImage::new(2, 2);
        assert_eq!(ocr.text(&image)?, "first");
        assert_eq!(ocr.text(&image)?, "second");
        assert_eq!(ocr.text(&image)?, "");
        Ok(())
    }

    #[test]
    fn tuning_file_keeps_defaults() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tuning.json");
        write_json(&path, &json!({"decision": {"recount_delay_ms": 0}, "weights": {"text": 0.9}}))?;
        let tuning = load_tuning(Some(&path))?;
        assert_eq!(tuning.decision.recount_delay_ms, 0);
        assert_eq!(tuning.decision.top_k, 3);
        assert_eq!(tuning.weights.text, 0.9);
        assert_eq!(load_tuning(None)?, TuningFile::default());
        Ok(())
    }

    #[test]
    fn query_and_pick_use_built_catalog() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = catalog_fixture(temp.path())?;

        let ranked = run_query(QueryArgs {
            catalog: catalog.clone(),
            title: "paying it forward".into(),
            type_hint: Some("support".into()),
            name: None,
            rarity: None,
            attribute: None,
            chain_step: None,
            portrait: None,
            preferred_trainee: None,
            top_k: 3,
            min_score: 0.5,
            tuning: None,
        })?;
        assert_eq!(
            ranked["results"][0]["key_step"],
            json!("support/Kitasan Black/SPD/SSR/Paying It Forward#s1")
        );

        let prefs_path = temp.path().join("prefs.json");
        write_json(&prefs_path, &json!({"overrides": {"support/Kitasan Black/SPD/SSR/Paying It Forward": 1}}))?;
        let picked = run_pick(PickArgs {
            catalog: catalog.clone(),
            key: "support/Kitasan Black/SPD/SSR/Paying It Forward".into(),
            prefs: PrefsArgs {
                prefs: Some(prefs_path),
                config: None,
            },
        })?;
        assert_eq!(picked["pick"], json!(1));

        let defaulted = run_pick(PickArgs {
            catalog,
            key: "support/Kitasan Black/SPD/SSR/Paying It Forward#s1".into(),
            prefs: PrefsArgs { prefs: None, config: None },
        })?;
        assert_eq!(defaulted["pick"], json!(2));
        Ok(())
    }

    #[test]
    fn replay_clicks_and_traces() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = catalog_fixture(temp.path())?;

        let frame = temp.path().join("frame.png");
        RgbImage::new(800, 600).save(&frame)?;
        let detections = temp.path().join("detections.json");
        write_json(
            &detections,
            &json!([
                {"name": "event_card", "conf": 0.93, "xyxy": [20.0, 20.0, 120.0, 120.0]},
                {"name": "event_choice", "conf": 0.88, "xyxy": [100.0, 360.0, 700.0, 400.0]},
                {"name": "event_choice", "conf": 0.91, "xyxy": [100.0, 300.0, 700.0, 340.0]},
            ]),
        )?;
        let ocr = temp.path().join("ocr.json");
        write_json(&ocr, &json!(["Support Card Event", "Paying It Forward"]))?;
        let trace = temp.path().join("trace.jsonl");

        let output = run_replay(ReplayArgs {
            catalog,
            frame,
            detections,
            ocr: Some(ocr),
            recapture: None,
            energy: Some(50),
            max_energy: 100,
            prefs: PrefsArgs { prefs: None, config: None },
            tuning: None,
            trace: Some(trace.clone()),
        })?;
        assert_eq!(output["decision"]["pick_option"], json!(2));
        assert_eq!(output["clicks"][0]["clicks"], json!(2));
        assert_eq!(output["clicks"][0]["bbox"], json!([100.0, 360.0, 700.0, 400.0]));
        assert_eq!(fs::read_to_string(&trace)?.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn unknown_key_is_an_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = catalog_fixture(temp.path())?;
        let result = run_pick(PickArgs {
            catalog,
            key: "support/Nobody/SPD/SSR/Nothing".into(),
            prefs: PrefsArgs { prefs: None, config: None },
        });
        assert!(result.is_err());
        Ok(())
    }
}
