use crate::errors::RcaError;
use crate::log_retention::prune_run_logs;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;
pub const RUN_LOG_PREFIX: &str = "run-";

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), RcaError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| RcaError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| RcaError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RcaError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| RcaError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| RcaError::Io(e.to_string()))
    }
}

fn run_log_slot() -> &'static Mutex<Option<JsonlLogger>> {
    static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();
    RUN_LOG.get_or_init(|| Mutex::new(None))
}

/// Points the process-wide run log at a fresh `run-<started_ms>.jsonl` file in
/// `dir`, pruning older run logs beyond `keep_runs`.
pub fn init_run_log(
    dir: &Path,
    started_ms: i64,
    max_payload_bytes: usize,
    keep_runs: usize,
) -> Result<PathBuf, RcaError> {
    fs::create_dir_all(dir).map_err(|e| RcaError::Io(e.to_string()))?;
    let path = dir.join(format!("{RUN_LOG_PREFIX}{started_ms}.jsonl"));
    let mut logger = JsonlLogger::new(&path);
    logger.max_payload_bytes = max_payload_bytes;
    {
        let mut slot = run_log_slot()
            .lock()
            .map_err(|_| RcaError::Io("run log lock poisoned".to_string()))?;
        *slot = Some(logger);
    }
    let pruned = prune_run_logs(dir, RUN_LOG_PREFIX, keep_runs.max(1))?;
    append_run_log(
        "info",
        "logging.run_log.opened",
        serde_json::json!({
            "path": path.display().to_string(),
            "pruned": pruned.len(),
        }),
    );
    Ok(path)
}

pub fn reset_run_log() {
    if let Ok(mut slot) = run_log_slot().lock() {
        *slot = None;
    }
}

/// Appends one structured event to the run log. Events are dropped when no
/// run log is configured; a failing write never interrupts analysis.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(slot) = run_log_slot().lock() else {
        return;
    };
    if let Some(logger) = slot.as_ref() {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
