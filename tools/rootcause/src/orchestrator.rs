use crate::errors::RcaError;
use crate::fsm::{AnalysisRun, AnalysisState};
use crate::grouper::{Grouper, MatchedRecord, DEFAULT_SIMILARITY_THRESHOLD};
use crate::inferencer::{Inferencer, DEFAULT_MAX_GROUP_SIZE};
use crate::ingest::FailureReceiver;
use crate::logging::append_run_log;
use crate::matcher::{CandidateScorer, PatternMatcher, DEFAULT_MIN_CANDIDATE_CONFIDENCE};
use crate::normalizer::Normalizer;
use crate::pattern_library::PatternLibrary;
use crate::runtime::{Clock, ProductionClock};
use crate::signature::short_fingerprint;
use crate::types::{
    AnalysisError, AnalysisReport, FailureRecord, MatchCandidate, RawFailure, RootCauseFinding,
};
use crate::worker_pool::{run_bounded, CancellationToken, StageBudget, StopReason};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_FINDING_CONFIDENCE: f64 = 0.15;

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub timeout: Duration,
    pub min_finding_confidence: f64,
    pub min_candidate_confidence: f64,
    pub max_group_size: usize,
    pub similarity_threshold: f64,
    /// Worker threads for normalizing and matching; 0 means one per core.
    pub workers: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            min_finding_confidence: DEFAULT_MIN_FINDING_CONFIDENCE,
            min_candidate_confidence: DEFAULT_MIN_CANDIDATE_CONFIDENCE,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            workers: 0,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), RcaError> {
        if self.timeout.is_zero() {
            return Err(RcaError::InvalidConfig(
                "analysis.timeout_seconds must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("analysis.min_finding_confidence", self.min_finding_confidence),
            ("analysis.min_candidate_confidence", self.min_candidate_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RcaError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(RcaError::InvalidConfig(format!(
                "analysis.similarity_threshold must be within (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.max_group_size == 0 {
            return Err(RcaError::InvalidConfig(
                "analysis.max_group_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn failure_id(position: usize) -> String {
    format!("f-{:04}", position + 1)
}

/// Drives one batch of raw failures through normalizing, matching, grouping
/// and inference. The library is shared across runs.
pub struct Analyzer {
    library: Arc<PatternLibrary>,
    scorer: Arc<dyn CandidateScorer>,
    normalizer: Normalizer,
    clock: Arc<dyn Clock>,
}

impl Analyzer {
    pub fn new(library: Arc<PatternLibrary>) -> Self {
        Self {
            library,
            scorer: Arc::new(PatternMatcher),
            normalizer: Normalizer::default(),
            clock: Arc::new(ProductionClock),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn CandidateScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }

    pub fn analyze(
        &self,
        raw: &[RawFailure],
        config: &AnalysisConfig,
    ) -> Result<AnalysisReport, RcaError> {
        self.analyze_with_cancel(raw, config, &CancellationToken::new())
    }

    /// Drains whatever is queued (up to `max_batch`) and analyzes it as one
    /// batch. Returns `None` once the queue is closed and empty.
    pub fn analyze_queue(
        &self,
        receiver: &mut FailureReceiver,
        max_batch: usize,
        config: &AnalysisConfig,
    ) -> Result<Option<AnalysisReport>, RcaError> {
        let batch = receiver.recv_batch(max_batch);
        if batch.is_empty() {
            return Ok(None);
        }
        self.analyze(&batch, config).map(Some)
    }

    pub fn analyze_with_cancel(
        &self,
        raw: &[RawFailure],
        config: &AnalysisConfig,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport, RcaError> {
        config.validate()?;
        let started = Instant::now();
        let deadline = started + config.timeout;
        let started_at = self.clock.now_unix_ms();
        let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let analysis_id = format!(
            "rca-{}",
            short_fingerprint(&[&started_at.to_string(), &sequence.to_string(), &raw.len().to_string()])
        );
        append_run_log(
            "info",
            "analysis.started",
            json!({
                "analysis_id": analysis_id,
                "total_failures": raw.len(),
                "timeout_ms": config.timeout.as_millis() as u64,
            }),
        );

        let mut run = AnalysisRun::default();
        let outcome = self.execute(&analysis_id, raw, config, cancel, deadline, &mut run);
        let mut report = match outcome {
            Ok(report) => report,
            Err(e) => {
                if !run.state.is_terminal() {
                    let _ = run.fail(e.to_string());
                }
                append_run_log(
                    "error",
                    "analysis.failed",
                    json!({ "analysis_id": analysis_id, "error": e.to_string() }),
                );
                return Err(e);
            }
        };
        report.started_at = started_at;
        report.duration_ms = started.elapsed().as_millis() as u64;

        let terminal = run.finish()?;
        append_run_log(
            "info",
            "analysis.finished",
            json!({
                "analysis_id": report.analysis_id,
                "state": terminal.as_str(),
                "findings": report.findings.len(),
                "unresolved": report.unresolved_failure_ids.len(),
                "errors": report.errors.len(),
                "duration_ms": report.duration_ms,
                "degraded_reason": run.degraded_reason,
            }),
        );
        Ok(report)
    }

    fn execute(
        &self,
        analysis_id: &str,
        raw: &[RawFailure],
        config: &AnalysisConfig,
        cancel: &CancellationToken,
        deadline: Instant,
        run: &mut AnalysisRun,
    ) -> Result<AnalysisReport, RcaError> {
        self.library.ensure_available()?;
        let ids = (0..raw.len()).map(failure_id).collect::<Vec<_>>();
        let position = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect::<HashMap<_, _>>();
        let mut errors = Vec::new();
        let mut unresolved = BTreeSet::new();

        advance(run, AnalysisState::Normalizing, analysis_id)?;
        let normalized = self.normalize_stage(&ids, raw, config, cancel, deadline)?;
        note_stop(run, normalized.stopped, analysis_id, "normalizing");
        let mut records = Vec::new();
        for (idx, result) in normalized.results.into_iter().enumerate() {
            match result {
                Some(Ok(Ok(record))) => records.push(record),
                Some(Ok(Err(e))) => errors.push(AnalysisError {
                    failure_id: ids[idx].clone(),
                    reason: e.to_string(),
                }),
                Some(Err(reason)) => errors.push(AnalysisError {
                    failure_id: ids[idx].clone(),
                    reason,
                }),
                None => {
                    unresolved.insert(idx);
                }
            }
        }

        let mut findings = Vec::new();
        if records.is_empty() {
            finish_early(run, analysis_id)?;
            return Ok(build_report(
                analysis_id,
                raw.len(),
                findings,
                unresolved,
                &ids,
                run.is_degraded(),
                errors,
            ));
        }

        advance(run, AnalysisState::Matching, analysis_id)?;
        let records = Arc::new(records);
        let matched = self.match_stage(Arc::clone(&records), config, cancel, deadline)?;
        note_stop(run, matched.stopped, analysis_id, "matching");
        let mut matched_records = Vec::new();
        for (record, result) in records.iter().zip(matched.results) {
            match result {
                Some(Ok(Ok(candidates))) => matched_records.push(MatchedRecord {
                    record: record.clone(),
                    candidates,
                }),
                Some(Ok(Err(e @ RcaError::LibraryUnavailable(_)))) => return Err(e),
                Some(Ok(Err(e))) => errors.push(AnalysisError {
                    failure_id: record.id.clone(),
                    reason: e.to_string(),
                }),
                Some(Err(reason)) => errors.push(AnalysisError {
                    failure_id: record.id.clone(),
                    reason,
                }),
                None => {
                    if let Some(idx) = position.get(&record.id) {
                        unresolved.insert(*idx);
                    }
                }
            }
        }
        if matched_records.is_empty() {
            finish_early(run, analysis_id)?;
            return Ok(build_report(
                analysis_id,
                raw.len(),
                findings,
                unresolved,
                &ids,
                run.is_degraded(),
                errors,
            ));
        }

        advance(run, AnalysisState::Grouping, analysis_id)?;
        let budget = StageBudget::new(deadline, cancel);
        let grouped = Grouper::new(config.similarity_threshold).group_within(&matched_records, &budget);
        note_stop(run, grouped.stopped, analysis_id, "grouping");
        mark_unresolved(&mut unresolved, &position, &grouped.ungrouped);
        let groups = grouped.groups;

        advance(run, AnalysisState::Inferring, analysis_id)?;
        let by_id = matched_records
            .iter()
            .map(|matched| (matched.record.id.as_str(), &matched.record))
            .collect::<HashMap<&str, &FailureRecord>>();
        let inferencer = Inferencer::new(config.max_group_size);
        for (done, group) in groups.iter().enumerate() {
            if let Some(reason) = budget.check() {
                note_stop(run, Some(reason), analysis_id, "inferring");
                for rest in &groups[done..] {
                    mark_unresolved(&mut unresolved, &position, &rest.member_ids);
                }
                break;
            }
            let members = group
                .member_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect::<Vec<_>>();
            let finding = inferencer.infer(group, &members, &self.library)?;
            if let Some(pattern_id) = &finding.pattern_id {
                self.accept_match(pattern_id, finding.member_failure_ids.len())?;
            }
            if finding.confidence < config.min_finding_confidence {
                mark_unresolved(&mut unresolved, &position, &finding.member_failure_ids);
            }
            findings.push(finding);
        }

        advance(run, AnalysisState::Reporting, analysis_id)?;
        Ok(build_report(
            analysis_id,
            raw.len(),
            findings,
            unresolved,
            &ids,
            run.is_degraded(),
            errors,
        ))
    }

    fn normalize_stage(
        &self,
        ids: &[String],
        raw: &[RawFailure],
        config: &AnalysisConfig,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<crate::worker_pool::PoolOutcome<Result<FailureRecord, RcaError>>, RcaError> {
        let items = Arc::new(
            ids.iter()
                .cloned()
                .zip(raw.iter().cloned())
                .collect::<Vec<_>>(),
        );
        let normalizer = self.normalizer.clone();
        let now_ms = self.clock.now_unix_ms();
        run_bounded("normalize", items, config.workers, deadline, cancel, move |(id, raw)| {
            normalizer.normalize(id, raw, now_ms)
        })
    }

    fn match_stage(
        &self,
        records: Arc<Vec<FailureRecord>>,
        config: &AnalysisConfig,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<crate::worker_pool::PoolOutcome<Result<Vec<MatchCandidate>, RcaError>>, RcaError> {
        let library = Arc::clone(&self.library);
        let scorer = Arc::clone(&self.scorer);
        let min_candidate_confidence = config.min_candidate_confidence;
        run_bounded("match", records, config.workers, deadline, cancel, move |record| {
            let candidates = library.lookup_candidates(record)?;
            Ok(scorer.score(record, &candidates, min_candidate_confidence))
        })
    }

    /// One usage bump per member record of an accepted known finding. A
    /// pattern id the library no longer knows is logged and skipped.
    fn accept_match(&self, pattern_id: &str, matched_records: usize) -> Result<(), RcaError> {
        for _ in 0..matched_records {
            match self.library.record_match(pattern_id) {
                Ok(_) => {}
                Err(RcaError::PatternNotFound(id)) => {
                    append_run_log(
                        "warn",
                        "analysis.record_match.missing",
                        json!({ "pattern_id": id }),
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn advance(run: &mut AnalysisRun, next: AnalysisState, analysis_id: &str) -> Result<(), RcaError> {
    let from = run.state;
    run.transition(next)?;
    append_run_log(
        "debug",
        "analysis.state",
        json!({
            "analysis_id": analysis_id,
            "from": from.as_str(),
            "to": next.as_str(),
        }),
    );
    Ok(())
}

/// Moves a run with no records left to Reporting: directly when degraded,
/// otherwise through the remaining (empty) stages.
fn finish_early(run: &mut AnalysisRun, analysis_id: &str) -> Result<(), RcaError> {
    if run.is_degraded() {
        let from = run.state;
        run.short_circuit("no records left to analyze")?;
        append_run_log(
            "debug",
            "analysis.state",
            json!({
                "analysis_id": analysis_id,
                "from": from.as_str(),
                "to": AnalysisState::Reporting.as_str(),
                "skipped": true,
            }),
        );
        return Ok(());
    }
    let remaining = [
        AnalysisState::Matching,
        AnalysisState::Grouping,
        AnalysisState::Inferring,
        AnalysisState::Reporting,
    ];
    let start = remaining
        .iter()
        .position(|state| *state == run.state)
        .map_or(0, |idx| idx + 1);
    for next in &remaining[start..] {
        advance(run, *next, analysis_id)?;
    }
    Ok(())
}

fn mark_unresolved(unresolved: &mut BTreeSet<usize>, position: &HashMap<String, usize>, ids: &[String]) {
    unresolved.extend(ids.iter().filter_map(|id| position.get(id).copied()));
}

fn note_stop(run: &mut AnalysisRun, stopped: Option<StopReason>, analysis_id: &str, stage: &str) {
    if let Some(reason) = stopped {
        run.mark_degraded(format!("{} during {stage}", reason.as_str()));
        append_run_log(
            "warn",
            "analysis.degraded",
            json!({
                "analysis_id": analysis_id,
                "stage": stage,
                "reason": reason.as_str(),
            }),
        );
    }
}

fn build_report(
    analysis_id: &str,
    total_failures: usize,
    mut findings: Vec<RootCauseFinding>,
    unresolved: BTreeSet<usize>,
    ids: &[String],
    degraded: bool,
    mut errors: Vec<AnalysisError>,
) -> AnalysisReport {
    findings.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.signature.cmp(&b.signature))
    });
    errors.sort_by(|a, b| a.failure_id.cmp(&b.failure_id));
    AnalysisReport {
        analysis_id: analysis_id.to_string(),
        started_at: 0,
        duration_ms: 0,
        total_failures,
        findings,
        unresolved_failure_ids: unresolved.into_iter().map(|idx| ids[idx].clone()).collect(),
        degraded,
        errors,
    }
}
