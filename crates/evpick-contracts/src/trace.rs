use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::decision::EventDecision;

pub type TracePayload = Map<String, Value>;

/// Append-only JSONL log of decisions. Every line carries `type`, `run_id`
/// and an RFC3339 `ts` next to its payload.
#[derive(Debug)]
pub struct DecisionLog {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl DecisionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_run_id(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, entry_type: &str, payload: TracePayload) -> anyhow::Result<Value> {
        let mut entry = Map::new();
        entry.insert("type".to_string(), Value::String(entry_type.to_string()));
        entry.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        entry.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        entry.extend(payload);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let line = serde_json::to_string(&entry)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("decision log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(entry))
    }

    pub fn record_decision(&self, decision: &EventDecision) -> anyhow::Result<Value> {
        let payload = match serde_json::to_value(decision)? {
            Value::Object(map) => map,
            _ => TracePayload::new(),
        };
        self.emit("event_decision", payload)
    }
}
