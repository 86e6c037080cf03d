use crate::errors::RcaError;
use crate::learner::{LearnerConfig, DEFAULT_LEARNED_CONFIDENCE, DEFAULT_RECURRENCE_THRESHOLD};
use crate::logging::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::normalizer::NormalizerConfig;
use crate::orchestrator::{AnalysisConfig, DEFAULT_MIN_FINDING_CONFIDENCE};
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub library_path: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub learn: bool,
    pub auto_promote: bool,
    pub state_db: Option<PathBuf>,
    pub save_library: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub analysis: AnalysisSection,
    pub normalizer: NormalizerConfig,
    pub learner: LearnerSection,
    pub library: LibrarySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSection {
    pub timeout_seconds: u64,
    pub min_finding_confidence: f64,
    pub min_candidate_confidence: f64,
    pub max_group_size: usize,
    pub similarity_threshold: f64,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnerSection {
    pub enabled: bool,
    pub recurrence_threshold: u64,
    pub auto_promote: bool,
    pub initial_confidence: f64,
    pub state_db: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibrarySection {
    pub path: Option<PathBuf>,
    pub save_after_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSection {
    /// Directory for `run-<ms>.jsonl` files; no run log when unset.
    pub dir: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub keep_runs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let analysis = AnalysisConfig::default();
        Self {
            analysis: AnalysisSection {
                timeout_seconds: analysis.timeout.as_secs(),
                min_finding_confidence: DEFAULT_MIN_FINDING_CONFIDENCE,
                min_candidate_confidence: analysis.min_candidate_confidence,
                max_group_size: analysis.max_group_size,
                similarity_threshold: analysis.similarity_threshold,
                workers: analysis.workers,
            },
            normalizer: NormalizerConfig::default(),
            learner: LearnerSection {
                enabled: false,
                recurrence_threshold: DEFAULT_RECURRENCE_THRESHOLD,
                auto_promote: false,
                initial_confidence: DEFAULT_LEARNED_CONFIDENCE,
                state_db: PathBuf::from(".rootcause/recurrence.sqlite"),
            },
            library: LibrarySection {
                path: None,
                save_after_run: false,
            },
            logging: LoggingSection {
                dir: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                keep_runs: 20,
            },
        }
    }
}

impl AppConfig {
    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            timeout: Duration::from_secs(self.analysis.timeout_seconds),
            min_finding_confidence: self.analysis.min_finding_confidence,
            min_candidate_confidence: self.analysis.min_candidate_confidence,
            max_group_size: self.analysis.max_group_size,
            similarity_threshold: self.analysis.similarity_threshold,
            workers: self.analysis.workers,
        }
    }

    pub fn learner_config(&self) -> LearnerConfig {
        LearnerConfig {
            recurrence_threshold: self.learner.recurrence_threshold,
            auto_promote: self.learner.auto_promote,
            initial_confidence: self.learner.initial_confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    analysis: Option<PartialAnalysisSection>,
    normalizer: Option<PartialNormalizerSection>,
    learner: Option<PartialLearnerSection>,
    library: Option<PartialLibrarySection>,
    logging: Option<PartialLoggingSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAnalysisSection {
    timeout_seconds: Option<u64>,
    min_finding_confidence: Option<f64>,
    min_candidate_confidence: Option<f64>,
    max_group_size: Option<usize>,
    similarity_threshold: Option<f64>,
    workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialNormalizerSection {
    max_message_bytes: Option<usize>,
    max_trace_frames: Option<usize>,
    strip_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLearnerSection {
    enabled: Option<bool>,
    recurrence_threshold: Option<u64>,
    auto_promote: Option<bool>,
    initial_confidence: Option<f64>,
    state_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLibrarySection {
    path: Option<PathBuf>,
    save_after_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingSection {
    dir: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    keep_runs: Option<usize>,
}

/// Defaults, then the TOML file, then CLI flags. Relative paths resolve
/// against `process_cwd`.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, RcaError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig =
            toml::from_str(&file_contents).map_err(|e| RcaError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    resolve_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(analysis) = partial.analysis {
        if let Some(value) = analysis.timeout_seconds {
            cfg.analysis.timeout_seconds = value;
        }
        if let Some(value) = analysis.min_finding_confidence {
            cfg.analysis.min_finding_confidence = value;
        }
        if let Some(value) = analysis.min_candidate_confidence {
            cfg.analysis.min_candidate_confidence = value;
        }
        if let Some(value) = analysis.max_group_size {
            cfg.analysis.max_group_size = value;
        }
        if let Some(value) = analysis.similarity_threshold {
            cfg.analysis.similarity_threshold = value;
        }
        if let Some(value) = analysis.workers {
            cfg.analysis.workers = value;
        }
    }

    if let Some(normalizer) = partial.normalizer {
        if let Some(value) = normalizer.max_message_bytes {
            cfg.normalizer.max_message_bytes = value;
        }
        if let Some(value) = normalizer.max_trace_frames {
            cfg.normalizer.max_trace_frames = value;
        }
        if let Some(value) = normalizer.strip_prefixes {
            cfg.normalizer.strip_prefixes = value;
        }
    }

    if let Some(learner) = partial.learner {
        if let Some(value) = learner.enabled {
            cfg.learner.enabled = value;
        }
        if let Some(value) = learner.recurrence_threshold {
            cfg.learner.recurrence_threshold = value;
        }
        if let Some(value) = learner.auto_promote {
            cfg.learner.auto_promote = value;
        }
        if let Some(value) = learner.initial_confidence {
            cfg.learner.initial_confidence = value;
        }
        if let Some(value) = learner.state_db {
            cfg.learner.state_db = value;
        }
    }

    if let Some(library) = partial.library {
        if let Some(value) = library.path {
            cfg.library.path = Some(value);
        }
        if let Some(value) = library.save_after_run {
            cfg.library.save_after_run = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.dir {
            cfg.logging.dir = Some(value);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.keep_runs {
            cfg.logging.keep_runs = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.library_path {
        cfg.library.path = Some(path.clone());
    }
    if let Some(timeout) = overrides.timeout_seconds {
        cfg.analysis.timeout_seconds = timeout;
    }
    if overrides.learn {
        cfg.learner.enabled = true;
    }
    if overrides.auto_promote {
        cfg.learner.enabled = true;
        cfg.learner.auto_promote = true;
    }
    if let Some(path) = &overrides.state_db {
        cfg.learner.state_db = path.clone();
    }
    if overrides.save_library {
        cfg.library.save_after_run = true;
    }
}

fn resolve_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    cfg.learner.state_db = absolutize_path(process_cwd, &cfg.learner.state_db);
    cfg.library.path = cfg
        .library
        .path
        .as_ref()
        .map(|path| absolutize_path(process_cwd, path));
    cfg.logging.dir = cfg
        .logging
        .dir
        .as_ref()
        .map(|path| absolutize_path(process_cwd, path));
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), RcaError> {
    cfg.analysis_config().validate()?;

    if cfg.normalizer.max_message_bytes == 0 {
        return Err(RcaError::InvalidConfig(
            "normalizer.max_message_bytes must be greater than zero".to_string(),
        ));
    }
    if cfg.learner.recurrence_threshold == 0 {
        return Err(RcaError::InvalidConfig(
            "learner.recurrence_threshold must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.learner.initial_confidence) {
        return Err(RcaError::InvalidConfig(format!(
            "learner.initial_confidence must be within [0, 1], got {}",
            cfg.learner.initial_confidence
        )));
    }
    if cfg.library.save_after_run && cfg.library.path.is_none() {
        return Err(RcaError::InvalidConfig(
            "library.save_after_run requires library.path".to_string(),
        ));
    }
    if cfg.learner.enabled && cfg.library.path.is_none() {
        return Err(RcaError::InvalidConfig(
            "learner.enabled requires library.path".to_string(),
        ));
    }
    if cfg.logging.keep_runs == 0 {
        return Err(RcaError::InvalidConfig(
            "logging.keep_runs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
