use crate::pattern_library::LibraryPattern;
use crate::types::{clamp_confidence, FailureRecord, MatchCandidate};
use std::cmp::Ordering;
use std::sync::Arc;

pub const DEFAULT_MIN_CANDIDATE_CONFIDENCE: f64 = 0.15;

/// Scores one record against its candidate patterns. Implementations must
/// be side-effect free; accepted matches are recorded by the orchestrator.
pub trait CandidateScorer: Send + Sync {
    fn score(
        &self,
        record: &FailureRecord,
        candidates: &[Arc<LibraryPattern>],
        min_candidate_confidence: f64,
    ) -> Vec<MatchCandidate>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PatternMatcher;

impl CandidateScorer for PatternMatcher {
    fn score(
        &self,
        record: &FailureRecord,
        candidates: &[Arc<LibraryPattern>],
        min_candidate_confidence: f64,
    ) -> Vec<MatchCandidate> {
        let mut scored = candidates
            .iter()
            .map(|entry| score_pattern(record, entry))
            .filter(|candidate| candidate.matched_rule_count > 0)
            .filter(|candidate| candidate.confidence >= min_candidate_confidence)
            .collect::<Vec<_>>();
        rank_candidates(&mut scored);
        scored
    }
}

pub fn score_pattern(record: &FailureRecord, entry: &LibraryPattern) -> MatchCandidate {
    let total_rule_count = entry.rules().len();
    let matched_rule_count = entry
        .rules()
        .iter()
        .filter(|rule| rule.fires(record))
        .count();
    let ratio = if total_rule_count == 0 {
        0.0
    } else {
        matched_rule_count as f64 / total_rule_count as f64
    };
    MatchCandidate {
        pattern_id: entry.pattern_id().to_string(),
        matched_rule_count,
        total_rule_count,
        confidence: clamp_confidence(entry.definition().confidence_base * ratio),
        usage_count: entry.usage_count(),
    }
}

/// Highest confidence first; ties go to the more-used pattern, then the
/// smaller id.
pub fn rank_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(compare_candidates);
}

pub fn compare_candidates(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.usage_count.cmp(&a.usage_count))
        .then_with(|| a.pattern_id.cmp(&b.pattern_id))
}

#[cfg(test)]
mod tests {
    use super::{CandidateScorer, PatternMatcher, DEFAULT_MIN_CANDIDATE_CONFIDENCE};
    use crate::pattern::{FailurePattern, MatchRule};
    use crate::pattern_library::PatternLibrary;
    use crate::types::{FailureCategory, FailureRecord, SourceKind};
    use std::collections::BTreeMap;

    fn record(message: &str, exit_code: &str) -> FailureRecord {
        let mut context = BTreeMap::new();
        context.insert("exit_code".to_string(), exit_code.to_string());
        FailureRecord {
            id: "f-0001".to_string(),
            source_kind: SourceKind::Build,
            identifier: "build".to_string(),
            message: message.to_string(),
            trace: Vec::new(),
            context,
            observed_at: 0,
        }
    }

    fn score(library: &PatternLibrary, rec: &FailureRecord) -> Vec<(String, f64, usize)> {
        let candidates = library.lookup_candidates(rec).expect("lookup");
        PatternMatcher
            .score(rec, &candidates, DEFAULT_MIN_CANDIDATE_CONFIDENCE)
            .into_iter()
            .map(|c| (c.pattern_id, c.confidence, c.matched_rule_count))
            .collect()
    }

    #[test]
    fn confidence_scales_with_fired_rules() {
        let library = PatternLibrary::new();
        library
            .insert(FailurePattern::new(
                "oom",
                vec![
                    MatchRule::substring("killed"),
                    MatchRule::key_equals("exit_code", "137"),
                ],
                FailureCategory::Environment,
                0.8,
            ))
            .expect("insert");

        let full = score(&library, &record("process killed", "137"));
        assert_eq!(full, vec![("oom".to_string(), 0.8, 2)]);

        let half = score(&library, &record("process killed", "1"));
        assert_eq!(half, vec![("oom".to_string(), 0.4, 1)]);
    }

    #[test]
    fn low_confidence_candidates_are_dropped() {
        let library = PatternLibrary::new();
        library
            .insert(FailurePattern::new(
                "weak",
                vec![MatchRule::substring("timeout")],
                FailureCategory::Infrastructure,
                0.1,
            ))
            .expect("insert");
        assert!(score(&library, &record("request timeout", "1")).is_empty());
    }

    #[test]
    fn ties_prefer_usage_then_id() {
        let library = PatternLibrary::new();
        for id in ["b-pattern", "a-pattern", "c-pattern"] {
            library
                .insert(FailurePattern::new(
                    id,
                    vec![
                        MatchRule::substring("timeout"),
                        MatchRule::key_equals("tag", id),
                    ],
                    FailureCategory::Infrastructure,
                    0.6,
                ))
                .expect("insert");
        }
        library.record_match("c-pattern").expect("usage");

        let ranked = score(&library, &record("request timeout", "1"))
            .into_iter()
            .map(|(id, _, _)| id)
            .collect::<Vec<_>>();
        assert_eq!(ranked, vec!["c-pattern", "a-pattern", "b-pattern"]);
    }
}
