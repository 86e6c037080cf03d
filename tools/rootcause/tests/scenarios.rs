use rootcause::errors::RcaError;
use rootcause::ingest;
use rootcause::learner::{LearnerConfig, PatternLearner};
use rootcause::matcher::{CandidateScorer, PatternMatcher};
use rootcause::orchestrator::{AnalysisConfig, Analyzer};
use rootcause::pattern::{FailurePattern, MatchRule};
use rootcause::pattern_library::{LibraryPattern, PatternLibrary};
use rootcause::recurrence_store::RecurrenceStore;
use rootcause::types::{FailureCategory, FailureRecord, MatchCandidate, RawFailure, SourceKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn raw(message: &str) -> RawFailure {
    RawFailure {
        source_kind: SourceKind::Test,
        message: Some(message.to_string()),
        ..RawFailure::default()
    }
}

fn infra_library() -> Arc<PatternLibrary> {
    let library = Arc::new(PatternLibrary::new());
    library
        .insert(
            FailurePattern::new(
                "db-refused",
                vec![MatchRule::substring("connection refused")],
                FailureCategory::Infrastructure,
                0.9,
            )
            .with_template("Database unreachable for {identifier}")
            .with_remediation(&["Check that the database service is running"]),
        )
        .expect("insert");
    library
}

#[test]
fn single_known_failure_is_explained_by_its_pattern() {
    let library = infra_library();
    let report = Analyzer::new(Arc::clone(&library))
        .analyze(
            &[raw("ERROR: connection refused to db:5432")],
            &AnalysisConfig::default(),
        )
        .expect("analyze");

    assert_eq!(report.total_failures, 1);
    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert!(finding.is_known_pattern);
    assert_eq!(finding.category, FailureCategory::Infrastructure);
    assert_eq!(finding.confidence, 0.9);
    assert_eq!(finding.pattern_id.as_deref(), Some("db-refused"));
    assert_eq!(finding.member_failure_ids, vec!["f-0001"]);
    assert!(report.unresolved_failure_ids.is_empty());
    assert!(!report.degraded);
}

#[test]
fn identical_unknown_failures_collapse_into_one_finding() {
    let inputs = (0..5)
        .map(|_| raw("AssertionError: expected 3 got 4"))
        .collect::<Vec<_>>();
    let report = Analyzer::new(Arc::new(PatternLibrary::new()))
        .analyze(&inputs, &AnalysisConfig::default())
        .expect("analyze");

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert!(!finding.is_known_pattern);
    assert_eq!(finding.member_failure_ids.len(), 5);
    assert!(finding.signature.starts_with("residual:"));
    assert!(finding.confidence <= 0.4);
    assert_eq!(
        finding.common_excerpt.as_deref(),
        Some("assertionerror: expected 3 got")
    );
}

#[test]
fn empty_input_yields_an_empty_complete_report() {
    let report = Analyzer::new(Arc::new(PatternLibrary::new()))
        .analyze(&[], &AnalysisConfig::default())
        .expect("analyze");
    assert_eq!(report.total_failures, 0);
    assert!(report.findings.is_empty());
    assert!(report.unresolved_failure_ids.is_empty());
    assert!(!report.degraded);
}

#[test]
fn unrelated_failures_each_get_their_own_low_confidence_finding() {
    let inputs = (0..100)
        .map(|n| raw(&format!("zq{n:03}x vw{n:03}y")))
        .collect::<Vec<_>>();
    let report = Analyzer::new(Arc::new(PatternLibrary::new()))
        .analyze(&inputs, &AnalysisConfig::default())
        .expect("analyze");

    assert_eq!(report.findings.len(), 100);
    for finding in &report.findings {
        assert_eq!(finding.member_failure_ids.len(), 1);
        assert!(!finding.is_known_pattern);
        assert!(finding.confidence <= 0.4, "{}", finding.confidence);
    }
}

#[test]
fn findings_partition_the_normalized_failures() {
    let library = infra_library();
    let inputs = vec![
        raw("connection refused to db:5432"),
        raw("AssertionError: expected 3 got 4"),
        RawFailure::default(),
        raw("AssertionError: expected 3 got 4"),
        raw("disk quota exceeded on runner"),
        raw("connection refused to cache:6379"),
    ];
    let report = Analyzer::new(library)
        .analyze(&inputs, &AnalysisConfig::default())
        .expect("analyze");

    let mut seen = BTreeSet::new();
    for finding in &report.findings {
        assert!((0.0..=1.0).contains(&finding.confidence));
        for id in &finding.member_failure_ids {
            assert!(seen.insert(id.clone()), "{id} appears in two findings");
        }
    }
    let errored = report
        .errors
        .iter()
        .map(|error| error.failure_id.clone())
        .collect::<BTreeSet<_>>();
    assert_eq!(errored, BTreeSet::from(["f-0003".to_string()]));
    assert!(seen.is_disjoint(&errored));
    assert_eq!(seen.len() + errored.len(), report.total_failures);

    let confidences = report
        .findings
        .iter()
        .map(|finding| finding.confidence)
        .collect::<Vec<_>>();
    assert!(confidences.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[test]
fn repeated_runs_produce_identical_findings() {
    let library = infra_library();
    let inputs = vec![
        raw("connection refused to db:5432"),
        raw("timeout waiting for selenium grid"),
        raw("timeout waiting for selenium hub"),
        raw("AssertionError: expected 3 got 4"),
        raw("module not found: left-pad"),
    ];
    let analyzer = Analyzer::new(library);
    let config = AnalysisConfig {
        workers: 3,
        ..AnalysisConfig::default()
    };
    let first = analyzer.analyze(&inputs, &config).expect("first");
    let second = analyzer.analyze(&inputs, &config).expect("second");

    assert_ne!(first.analysis_id, second.analysis_id);
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.unresolved_failure_ids, second.unresolved_failure_ids);
}

#[test]
fn recurring_failure_is_learned_after_three_runs() {
    let library = Arc::new(PatternLibrary::new());
    let learner = PatternLearner::new(
        RecurrenceStore::in_memory().expect("store"),
        LearnerConfig {
            auto_promote: true,
            ..LearnerConfig::default()
        },
    );
    let analyzer = Analyzer::new(Arc::clone(&library));
    let inputs = vec![
        raw("AssertionError: expected 3 got 4"),
        raw("AssertionError: expected 3 got 4"),
    ];

    let mut learned = Vec::new();
    for _ in 0..3 {
        let report = analyzer
            .analyze(&inputs, &AnalysisConfig::default())
            .expect("analyze");
        assert!(!report.findings[0].is_known_pattern);
        learned.extend(learner.learn(&report, &library).expect("learn"));
    }
    assert_eq!(learned.len(), 1);
    assert_eq!(library.active_len(), 1);

    let report = analyzer
        .analyze(&inputs, &AnalysisConfig::default())
        .expect("analyze");
    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert!(finding.is_known_pattern);
    assert_eq!(finding.pattern_id.as_deref(), Some(learned[0].as_str()));
    assert_eq!(finding.confidence, 0.3);
}

struct SlowScorer;

impl CandidateScorer for SlowScorer {
    fn score(
        &self,
        record: &FailureRecord,
        candidates: &[Arc<LibraryPattern>],
        min_candidate_confidence: f64,
    ) -> Vec<MatchCandidate> {
        if record.message.contains("slow") {
            thread::sleep(Duration::from_secs(2));
        }
        PatternMatcher.score(record, candidates, min_candidate_confidence)
    }
}

#[test]
fn timeout_returns_a_degraded_partial_report() {
    let library = infra_library();
    let inputs = vec![
        raw("connection refused to db:5432"),
        raw("connection refused to cache:6379"),
        raw("connection refused to queue:5672"),
        raw("connection refused to search:9200"),
        raw("slow fixture never finished"),
        raw("slow teardown never finished"),
    ];
    let config = AnalysisConfig {
        timeout: Duration::from_secs(1),
        workers: 4,
        ..AnalysisConfig::default()
    };
    let started = Instant::now();
    let report = Analyzer::new(library)
        .with_scorer(Arc::new(SlowScorer))
        .analyze(&inputs, &config)
        .expect("analyze");
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(1900), "took {elapsed:?}");
    assert!(report.degraded);
    assert_eq!(report.unresolved_failure_ids, vec!["f-0005", "f-0006"]);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].member_failure_ids.len(), 4);
}

#[test]
fn inserting_the_same_matchers_twice_is_rejected() {
    let library = infra_library();
    let again = FailurePattern::new(
        "db-refused-copy",
        vec![MatchRule::substring("connection refused")],
        FailureCategory::Infrastructure,
        0.5,
    );
    assert!(matches!(
        library.insert(again),
        Err(RcaError::DuplicatePattern(_))
    ));
    assert_eq!(library.len(), 1);
}

#[test]
fn concurrent_analyses_share_one_library() {
    let library = infra_library();
    let handles = (0..4)
        .map(|n| {
            let library = Arc::clone(&library);
            thread::spawn(move || {
                Analyzer::new(library)
                    .analyze(
                        &[raw(&format!("connection refused to worker-{n}"))],
                        &AnalysisConfig::default(),
                    )
                    .expect("analyze")
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        let report = handle.join().expect("join");
        assert!(report.findings[0].is_known_pattern);
    }
    let entry = library.entry("db-refused").expect("lookup").expect("present");
    assert_eq!(entry.usage_count(), 4);
}

#[test]
fn queued_failures_are_analyzed_in_batches() {
    let (sender, mut receiver) = ingest::bounded(8);
    for n in 0..3 {
        sender
            .push(raw(&format!("connection refused to shard-{n}")))
            .expect("push");
    }
    drop(sender);

    let analyzer = Analyzer::new(infra_library());
    let report = analyzer
        .analyze_queue(&mut receiver, 2, &AnalysisConfig::default())
        .expect("analyze")
        .expect("first batch");
    assert_eq!(report.total_failures, 2);
    let report = analyzer
        .analyze_queue(&mut receiver, 2, &AnalysisConfig::default())
        .expect("analyze")
        .expect("second batch");
    assert_eq!(report.total_failures, 1);
    assert!(analyzer
        .analyze_queue(&mut receiver, 2, &AnalysisConfig::default())
        .expect("analyze")
        .is_none());
}

#[test]
fn many_distinct_failures_respect_the_timeout() {
    let inputs = (0..4000)
        .map(|n| raw(&format!("error qa{n}x qb{n}y qc{n}z")))
        .collect::<Vec<_>>();
    let config = AnalysisConfig {
        timeout: Duration::from_secs(1),
        ..AnalysisConfig::default()
    };
    let started = Instant::now();
    let report = Analyzer::new(Arc::new(PatternLibrary::new()))
        .analyze(&inputs, &config)
        .expect("analyze");
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    let grouped = report
        .findings
        .iter()
        .map(|finding| finding.member_failure_ids.len())
        .sum::<usize>();
    let unresolved_outside_findings = report
        .unresolved_failure_ids
        .iter()
        .filter(|id| {
            !report
                .findings
                .iter()
                .any(|finding| finding.member_failure_ids.contains(id))
        })
        .count();
    assert_eq!(grouped + unresolved_outside_findings, 4000);
    if !report.degraded {
        assert_eq!(report.findings.len(), 4000);
    }
}

#[test]
fn needle_inside_a_camel_case_word_still_matches() {
    let library = Arc::new(PatternLibrary::new());
    library
        .insert(FailurePattern::new(
            "timeout",
            vec![MatchRule::substring("timeout")],
            FailureCategory::Infrastructure,
            0.9,
        ))
        .expect("insert");
    let report = Analyzer::new(library)
        .analyze(
            &[raw("java.net.ConnectTimeoutException: db")],
            &AnalysisConfig::default(),
        )
        .expect("analyze");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].pattern_id.as_deref(), Some("timeout"));
    assert_eq!(report.findings[0].confidence, 0.9);
}
