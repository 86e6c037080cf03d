use crate::errors::RcaError;
use std::fs;
use std::path::{Path, PathBuf};

/// Keeps the `keep` newest files in `dir` whose name starts with `prefix` and
/// deletes the rest. Unrelated files are never touched.
pub fn prune_run_logs(dir: &Path, prefix: &str, keep: usize) -> Result<Vec<PathBuf>, RcaError> {
    let mut logs = fs::read_dir(dir)
        .map_err(|e| RcaError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect::<Vec<_>>();

    // Newest first; the name breaks ties so equal mtimes stay deterministic.
    logs.sort_by(|a, b| {
        let ma = fs::metadata(a).ok().and_then(|m| m.modified().ok());
        let mb = fs::metadata(b).ok().and_then(|m| m.modified().ok());
        mb.cmp(&ma).then_with(|| b.cmp(a))
    });

    let mut deleted = Vec::new();
    for path in logs.into_iter().skip(keep) {
        fs::remove_file(&path).map_err(|e| RcaError::Io(e.to_string()))?;
        deleted.push(path);
    }
    Ok(deleted)
}
