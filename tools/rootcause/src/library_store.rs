//! JSONL persistence for the pattern library: one `FailurePattern` per line,
//! ordered by `pattern_id`.

use crate::errors::RcaError;
use crate::logging::append_run_log;
use crate::pattern::FailurePattern;
use crate::pattern_library::PatternLibrary;
use crate::runtime::{Clock, FileSystem};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub fn encode_patterns(patterns: &[FailurePattern]) -> Result<String, RcaError> {
    let mut sorted = patterns.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
    let mut out = String::new();
    for pattern in sorted {
        let line = serde_json::to_string(pattern)
            .map_err(|e| RcaError::Persistence(format!("{}: {e}", pattern.pattern_id)))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Blank lines are skipped; any other unparsable line fails the whole load.
pub fn decode_patterns(data: &str) -> Result<Vec<FailurePattern>, RcaError> {
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<FailurePattern>(line)
                .map_err(|e| RcaError::Persistence(format!("line {}: {e}", idx + 1)))
        })
        .collect()
}

/// Builds a library from a JSONL file. Any read, parse or insert failure is
/// reported as `LibraryUnavailable`; a missing file yields an empty library.
pub fn load_library(
    path: &Path,
    fs: &dyn FileSystem,
    clock: Arc<dyn Clock>,
) -> Result<PatternLibrary, RcaError> {
    if !fs.exists(path) {
        append_run_log(
            "info",
            "library_store.load.missing",
            json!({ "path": path.display().to_string() }),
        );
        return Ok(PatternLibrary::with_clock(clock));
    }
    let unavailable = |e: RcaError| RcaError::LibraryUnavailable(format!("{}: {e}", path.display()));
    let data = fs.read_to_string(path).map_err(unavailable)?;
    let patterns = decode_patterns(&data).map_err(unavailable)?;
    let count = patterns.len();
    let library = PatternLibrary::from_patterns(patterns, clock).map_err(unavailable)?;
    append_run_log(
        "info",
        "library_store.loaded",
        json!({
            "path": path.display().to_string(),
            "patterns": count,
            "active": library.active_len(),
        }),
    );
    Ok(library)
}

pub fn save_library(
    path: &Path,
    library: &PatternLibrary,
    fs: &dyn FileSystem,
) -> Result<usize, RcaError> {
    let patterns = library.snapshot()?;
    let data = encode_patterns(&patterns)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs.create_dir_all(parent)?;
        }
    }
    fs.write_string(path, &data)?;
    append_run_log(
        "info",
        "library_store.saved",
        json!({ "path": path.display().to_string(), "patterns": patterns.len() }),
    );
    Ok(patterns.len())
}
