use crate::errors::RcaError;
use crate::inferencer::category_hint;
use crate::logging::append_run_log;
use crate::pattern::{FailurePattern, MatchRule, PatternOrigin};
use crate::pattern_library::PatternLibrary;
use crate::recurrence_store::{RecurrenceStore, SignatureRecord, SignatureStatus, Sighting};
use crate::signature::short_fingerprint;
use crate::types::AnalysisReport;
use serde_json::json;

pub const DEFAULT_RECURRENCE_THRESHOLD: u64 = 3;
pub const DEFAULT_LEARNED_CONFIDENCE: f64 = 0.3;
pub const LEARNED_PREFIX: &str = "learned-";
const RESIDUAL_PREFIX: &str = "residual:";

#[derive(Debug, Clone, PartialEq)]
pub struct LearnerConfig {
    pub recurrence_threshold: u64,
    /// Insert synthesized patterns immediately instead of queueing them for
    /// approval.
    pub auto_promote: bool,
    pub initial_confidence: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            recurrence_threshold: DEFAULT_RECURRENCE_THRESHOLD,
            auto_promote: false,
            initial_confidence: DEFAULT_LEARNED_CONFIDENCE,
        }
    }
}

pub struct PatternLearner {
    store: RecurrenceStore,
    config: LearnerConfig,
}

impl PatternLearner {
    pub fn new(store: RecurrenceStore, config: LearnerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &RecurrenceStore {
        &self.store
    }

    /// Records this run's residual signatures and promotes (or proposes)
    /// those that crossed the recurrence threshold. Returns the ids of
    /// patterns inserted into `library`.
    pub fn learn(
        &self,
        report: &AnalysisReport,
        library: &PatternLibrary,
    ) -> Result<Vec<String>, RcaError> {
        let mut inserted = Vec::new();
        for finding in &report.findings {
            if finding.is_known_pattern || !finding.signature.starts_with(RESIDUAL_PREFIX) {
                continue;
            }
            let record = self.store.record_sighting(Sighting {
                signature: finding.signature.clone(),
                analysis_id: report.analysis_id.clone(),
                category: finding.category,
                excerpt: finding
                    .common_excerpt
                    .clone()
                    .filter(|excerpt| !excerpt.trim().is_empty()),
                seen_at: report.started_at,
            })?;
            if record.status == SignatureStatus::Promoted
                || record.run_count < self.config.recurrence_threshold
                || record.excerpt.is_none()
            {
                continue;
            }

            if self.config.auto_promote {
                if let Some(pattern_id) = self.promote(&record, library)? {
                    inserted.push(pattern_id);
                }
            } else if record.status == SignatureStatus::Tracking {
                self.store.mark_pending(&record.signature)?;
                append_run_log(
                    "info",
                    "learner.proposal.queued",
                    json!({
                        "signature": record.signature,
                        "run_count": record.run_count,
                        "excerpt": record.excerpt,
                    }),
                );
            }
        }
        Ok(inserted)
    }

    /// Patterns awaiting approval, ordered by signature.
    pub fn pending_proposals(&self) -> Result<Vec<(String, FailurePattern)>, RcaError> {
        Ok(self
            .store
            .list_by_status(SignatureStatus::Pending)?
            .into_iter()
            .filter_map(|record| {
                synthesize(&record, self.config.initial_confidence)
                    .map(|pattern| (record.signature.clone(), pattern))
            })
            .collect())
    }

    pub fn approve(&self, signature: &str, library: &PatternLibrary) -> Result<Option<String>, RcaError> {
        let record = self
            .store
            .get(signature)?
            .filter(|record| record.status == SignatureStatus::Pending)
            .ok_or_else(|| RcaError::PatternNotFound(format!("no pending proposal for {signature}")))?;
        self.promote(&record, library)
    }

    /// Inserts the synthesized pattern and marks the signature promoted. A
    /// signature whose matcher set is already in the library is marked
    /// promoted without inserting anything.
    fn promote(
        &self,
        record: &SignatureRecord,
        library: &PatternLibrary,
    ) -> Result<Option<String>, RcaError> {
        let Some(pattern) = synthesize(record, self.config.initial_confidence) else {
            return Ok(None);
        };
        let pattern_id = pattern.pattern_id.clone();
        let outcome = match library.insert(pattern) {
            Ok(id) => Some(id),
            Err(RcaError::DuplicatePattern(reason)) => {
                append_run_log(
                    "info",
                    "learner.promotion.already_covered",
                    json!({ "signature": record.signature, "reason": reason }),
                );
                None
            }
            Err(e) => return Err(e),
        };
        self.store.mark_promoted(&record.signature, &pattern_id)?;
        append_run_log(
            "info",
            "learner.promoted",
            json!({
                "signature": record.signature,
                "pattern_id": pattern_id,
                "inserted": outcome.is_some(),
                "run_count": record.run_count,
            }),
        );
        Ok(outcome)
    }
}

pub fn learned_pattern_id(signature: &str) -> String {
    format!("{LEARNED_PREFIX}{}", short_fingerprint(&[signature]))
}

fn synthesize(record: &SignatureRecord, confidence_base: f64) -> Option<FailurePattern> {
    let excerpt = record.excerpt.as_deref()?.trim();
    if excerpt.is_empty() {
        return None;
    }
    // Braces in the excerpt would read as template placeholders.
    let shown = excerpt.replace('{', "(").replace('}', ")");
    let mut remediation = Vec::new();
    if let Some(hint) = category_hint(record.category) {
        remediation.push(hint.to_string());
    }
    remediation.push("Review this learned pattern and curate its remediation".to_string());

    let mut pattern = FailurePattern::new(
        learned_pattern_id(&record.signature),
        vec![MatchRule::substring(excerpt)],
        record.category,
        confidence_base,
    )
    .with_template(format!(
        "Recurring {} failure seen in {} runs: \"{shown}\"",
        record.category.as_str(),
        record.run_count
    ));
    pattern.remediation_steps = remediation;
    pattern.origin = PatternOrigin::Learned;
    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::{learned_pattern_id, LearnerConfig, PatternLearner};
    use crate::pattern_library::PatternLibrary;
    use crate::recurrence_store::RecurrenceStore;
    use crate::types::{AnalysisReport, FailureCategory, RootCauseFinding};

    fn report(analysis_id: &str, excerpt: Option<&str>) -> AnalysisReport {
        AnalysisReport {
            analysis_id: analysis_id.to_string(),
            started_at: 1_000,
            duration_ms: 1,
            total_failures: 2,
            findings: vec![RootCauseFinding {
                signature: "residual:abc".to_string(),
                category: FailureCategory::Logic,
                description: "x".to_string(),
                confidence: 0.35,
                remediation_steps: Vec::new(),
                member_failure_ids: vec!["f-0001".to_string(), "f-0002".to_string()],
                is_known_pattern: false,
                pattern_id: None,
                common_excerpt: excerpt.map(str::to_string),
            }],
            unresolved_failure_ids: Vec::new(),
            degraded: false,
            errors: Vec::new(),
        }
    }

    fn learner(auto_promote: bool) -> PatternLearner {
        PatternLearner::new(
            RecurrenceStore::in_memory().expect("store"),
            LearnerConfig {
                auto_promote,
                ..LearnerConfig::default()
            },
        )
    }

    #[test]
    fn promotes_on_third_distinct_run_only() {
        let library = PatternLibrary::new();
        let learner = learner(true);
        let excerpt = Some("assertionerror: expected 3 got");
        assert!(learner.learn(&report("run-1", excerpt), &library).expect("1").is_empty());
        assert!(learner.learn(&report("run-1", excerpt), &library).expect("1 again").is_empty());
        assert!(learner.learn(&report("run-2", excerpt), &library).expect("2").is_empty());
        let promoted = learner.learn(&report("run-3", excerpt), &library).expect("3");
        assert_eq!(promoted, vec![learned_pattern_id("residual:abc")]);

        let pattern = library.get(&promoted[0]).expect("get").expect("present");
        assert_eq!(pattern.confidence_base, 0.3);
        assert_eq!(pattern.category, FailureCategory::Logic);

        assert!(learner.learn(&report("run-4", excerpt), &library).expect("4").is_empty());
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn gated_learning_waits_for_approval() {
        let library = PatternLibrary::new();
        let learner = learner(false);
        for run in ["a", "b", "c"] {
            assert!(learner
                .learn(&report(run, Some("disk quota exceeded")), &library)
                .expect("learn")
                .is_empty());
        }
        assert!(library.is_empty());
        let proposals = learner.pending_proposals().expect("pending");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].0, "residual:abc");

        let id = learner.approve("residual:abc", &library).expect("approve");
        assert_eq!(id, Some(learned_pattern_id("residual:abc")));
        assert!(learner.approve("residual:abc", &library).is_err());
        assert!(learner.pending_proposals().expect("pending").is_empty());
    }

    #[test]
    fn clusters_without_excerpt_are_never_promoted() {
        let library = PatternLibrary::new();
        let learner = learner(true);
        for run in ["a", "b", "c", "d"] {
            learner.learn(&report(run, None), &library).expect("learn");
        }
        assert!(library.is_empty());
    }
}
