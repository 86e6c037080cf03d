pub mod config;
pub mod errors;
pub mod fsm;
pub mod grouper;
pub mod inferencer;
pub mod ingest;
pub mod learner;
pub mod library_store;
pub mod log_retention;
pub mod logging;
pub mod matcher;
pub mod normalizer;
pub mod orchestrator;
pub mod pattern;
pub mod pattern_library;
pub mod recurrence_store;
pub mod report;
pub mod runtime;
pub mod signature;
pub mod types;
pub mod worker_pool;

use clap::{error::ErrorKind, CommandFactory, Parser, ValueEnum};
use config::{load_config, AppConfig, CliOverrides, OutputFormat};
use errors::RcaError;
use learner::PatternLearner;
use library_store::{load_library, save_library};
use logging::{append_run_log, init_run_log};
use normalizer::Normalizer;
use orchestrator::Analyzer;
use pattern_library::PatternLibrary;
use recurrence_store::RecurrenceStore;
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use types::RawFailure;

#[derive(Debug, Clone, Parser)]
#[command(name = "rootcause")]
#[command(about = "Groups CI and test failures and infers their root causes")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// JSONL file with one raw failure per line.
    #[arg(long)]
    pub input: PathBuf,
    /// JSONL pattern library.
    #[arg(long)]
    pub library: Option<PathBuf>,
    /// Analysis budget in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Only analyze failures with this identifier.
    #[arg(long)]
    pub failure: Option<String>,
    #[arg(long, value_enum, default_value_t = CliFormat::Human)]
    pub format: CliFormat,
    /// Record recurring signatures and promote them. Requires --library.
    #[arg(long, default_value_t = false)]
    pub learn: bool,
    #[arg(long, default_value_t = false)]
    pub auto_promote: bool,
    #[arg(long)]
    pub state_db: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub save_library: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliFormat {
    Human,
    Json,
}

impl From<CliFormat> for OutputFormat {
    fn from(value: CliFormat) -> Self {
        match value {
            CliFormat::Human => OutputFormat::Human,
            CliFormat::Json => OutputFormat::Json,
        }
    }
}

pub fn run() -> Result<i32, RcaError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| RcaError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, RcaError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(RcaError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        library_path: cli.library.clone(),
        timeout_seconds: cli.timeout,
        learn: cli.learn,
        auto_promote: cli.auto_promote,
        state_db: cli.state_db.clone(),
        save_library: cli.save_library,
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;

    if let Some(dir) = &cfg.logging.dir {
        init_run_log(
            dir,
            runtime.clock.now_unix_ms(),
            cfg.logging.max_payload_bytes,
            cfg.logging.keep_runs,
        )?;
    }

    let library = Arc::new(match &cfg.library.path {
        Some(path) => load_library(path, runtime.file_system.as_ref(), Arc::clone(&runtime.clock))?,
        None => PatternLibrary::with_clock(Arc::clone(&runtime.clock)),
    });

    let input_path = config::absolutize_path(cwd, &cli.input);
    let mut failures = parse_failures(&runtime.file_system.read_to_string(&input_path)?)?;
    if let Some(identifier) = &cli.failure {
        failures.retain(|raw| raw.identifier.as_deref() == Some(identifier.as_str()));
        if failures.is_empty() {
            return Err(RcaError::Cli(format!(
                "no failure with identifier `{identifier}` in {}",
                input_path.display()
            )));
        }
    }

    let analyzer = Analyzer::new(Arc::clone(&library))
        .with_normalizer(Normalizer::new(cfg.normalizer.clone()))
        .with_clock(Arc::clone(&runtime.clock));
    let analysis = cfg.analysis_config();
    let report = analyzer.analyze(&failures, &analysis)?;

    let learned = learn_from(&cfg, &report, &library)?;
    if let Some(path) = &cfg.library.path {
        if cfg.library.save_after_run || !learned.is_empty() {
            save_library(path, &library, runtime.file_system.as_ref())?;
        }
    }

    let output = match OutputFormat::from(cli.format) {
        OutputFormat::Json => report::to_json(&report)?,
        OutputFormat::Human => {
            let mut rendered = report::render_markdown(&report);
            if !learned.is_empty() {
                rendered.push_str(&format!("\nLearned patterns: {}\n", learned.join(", ")));
            }
            rendered
        }
    };
    runtime.terminal.write_line(output.trim_end())?;

    let code = report::exit_code(&report, analysis.min_finding_confidence);
    append_run_log(
        "info",
        "cli.finished",
        json!({
            "analysis_id": report.analysis_id,
            "exit_code": code,
            "learned": learned,
        }),
    );
    Ok(code)
}

fn learn_from(
    cfg: &AppConfig,
    report: &types::AnalysisReport,
    library: &PatternLibrary,
) -> Result<Vec<String>, RcaError> {
    if !cfg.learner.enabled {
        return Ok(Vec::new());
    }
    let store = RecurrenceStore::open(&cfg.learner.state_db)?;
    PatternLearner::new(store, cfg.learner_config()).learn(report, library)
}

/// One `RawFailure` JSON object per line; blank lines are skipped.
pub fn parse_failures(data: &str) -> Result<Vec<RawFailure>, RcaError> {
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<RawFailure>(line)
                .map_err(|e| RcaError::Cli(format!("input line {}: {e}", idx + 1)))
        })
        .collect()
}

pub fn render_help() -> String {
    Cli::command().render_long_help().to_string()
}
