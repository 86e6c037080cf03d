use crate::errors::RcaError;
use crate::logging::append_run_log;
use crate::pattern::{CompiledRule, FailurePattern, IndexKey, GRAM_LEN};
use crate::runtime::{Clock, ProductionClock};
use crate::signature::word_spans;
use crate::types::FailureRecord;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

const NEVER_MATCHED: i64 = i64::MIN;

type LibraryResult<T> = Result<T, RcaError>;

/// A library entry: the curated definition plus compiled rules and the
/// counters the matcher bumps without taking the write lock.
#[derive(Debug)]
pub struct LibraryPattern {
    definition: FailurePattern,
    rules: Vec<CompiledRule>,
    fingerprint: String,
    usage_count: AtomicU64,
    last_matched_at: AtomicI64,
    retired: AtomicBool,
}

impl LibraryPattern {
    fn compile(pattern: FailurePattern) -> LibraryResult<Self> {
        pattern.validate()?;
        let rules = pattern
            .matchers
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                RcaError::InvalidPattern(reason) => {
                    RcaError::InvalidPattern(format!("{}: {reason}", pattern.pattern_id))
                }
                other => other,
            })?;
        Ok(Self {
            fingerprint: pattern.matcher_fingerprint(),
            usage_count: AtomicU64::new(pattern.usage_count),
            last_matched_at: AtomicI64::new(pattern.last_matched_at.unwrap_or(NEVER_MATCHED)),
            retired: AtomicBool::new(pattern.retired),
            rules,
            definition: pattern,
        })
    }

    pub fn pattern_id(&self) -> &str {
        &self.definition.pattern_id
    }

    pub fn definition(&self) -> &FailurePattern {
        &self.definition
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Acquire)
    }

    pub fn last_matched_at(&self) -> Option<i64> {
        match self.last_matched_at.load(Ordering::Acquire) {
            NEVER_MATCHED => None,
            value => Some(value),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Point-in-time copy with the live counters folded in.
    pub fn snapshot(&self) -> FailurePattern {
        let mut pattern = self.definition.clone();
        pattern.usage_count = self.usage_count();
        pattern.last_matched_at = self.last_matched_at();
        pattern.retired = self.is_retired();
        pattern
    }
}

#[derive(Debug, Default)]
struct LibraryState {
    entries: BTreeMap<String, Arc<LibraryPattern>>,
    token_index: HashMap<String, BTreeSet<String>>,
    gram_index: HashMap<String, BTreeSet<String>>,
    unindexed: BTreeSet<String>,
    active_fingerprints: HashMap<String, String>,
    version: u64,
}

impl LibraryState {
    fn index(&mut self, entry: &LibraryPattern) {
        let id = entry.pattern_id().to_string();
        self.active_fingerprints
            .insert(entry.fingerprint.clone(), id.clone());
        let key = entry
            .definition
            .matchers
            .first()
            .and_then(|rule| rule.index_key());
        match key {
            Some(IndexKey::Token(token)) => {
                self.token_index.entry(token).or_default().insert(id);
            }
            Some(IndexKey::Gram(gram)) => {
                self.gram_index.entry(gram).or_default().insert(id);
            }
            None => {
                self.unindexed.insert(id);
            }
        }
    }

    fn unindex(&mut self, entry: &LibraryPattern) {
        let id = entry.pattern_id();
        self.active_fingerprints.remove(&entry.fingerprint);
        self.unindexed.remove(id);
        for index in [&mut self.token_index, &mut self.gram_index] {
            index.retain(|_, ids| {
                ids.remove(id);
                !ids.is_empty()
            });
        }
    }
}

/// Shared, lockable pattern library. Reads (candidate lookup, scoring,
/// `record_match`) take the read lock; `insert`/`retire` take the write lock.
pub struct PatternLibrary {
    state: RwLock<LibraryState>,
    unavailable: RwLock<Option<String>>,
    clock: Arc<dyn Clock>,
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternLibrary {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ProductionClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LibraryState::default()),
            unavailable: RwLock::new(None),
            clock,
        }
    }

    pub fn from_patterns(
        patterns: Vec<FailurePattern>,
        clock: Arc<dyn Clock>,
    ) -> LibraryResult<Self> {
        let library = Self::with_clock(clock);
        for pattern in patterns {
            library.insert(pattern)?;
        }
        Ok(library)
    }

    fn read_state(&self) -> LibraryResult<RwLockReadGuard<'_, LibraryState>> {
        self.ensure_available()?;
        self.state
            .read()
            .map_err(|_| RcaError::LibraryUnavailable("library lock poisoned".to_string()))
    }

    fn write_state(&self) -> LibraryResult<RwLockWriteGuard<'_, LibraryState>> {
        self.ensure_available()?;
        self.state
            .write()
            .map_err(|_| RcaError::LibraryUnavailable("library lock poisoned".to_string()))
    }

    pub fn ensure_available(&self) -> LibraryResult<()> {
        let reason = self
            .unavailable
            .read()
            .map_err(|_| RcaError::LibraryUnavailable("availability lock poisoned".to_string()))?;
        match reason.as_ref() {
            Some(reason) => Err(RcaError::LibraryUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Flags the library unreadable, e.g. after a failed reload left its
    /// contents in an unknown state.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        append_run_log(
            "error",
            "pattern_library.unavailable",
            json!({ "reason": reason }),
        );
        if let Ok(mut slot) = self.unavailable.write() {
            *slot = Some(reason);
        }
    }

    pub fn mark_available(&self) {
        if let Ok(mut slot) = self.unavailable.write() {
            *slot = None;
        }
    }

    pub fn insert(&self, pattern: FailurePattern) -> LibraryResult<String> {
        let entry = LibraryPattern::compile(pattern)?;
        let id = entry.pattern_id().to_string();
        let mut state = self.write_state()?;

        if state.entries.contains_key(&id) {
            append_run_log(
                "warn",
                "pattern_library.insert.duplicate_id",
                json!({ "pattern_id": id }),
            );
            return Err(RcaError::DuplicatePattern(format!(
                "pattern id {id} already exists"
            )));
        }
        if !entry.is_retired() {
            if let Some(existing) = state.active_fingerprints.get(&entry.fingerprint) {
                append_run_log(
                    "warn",
                    "pattern_library.insert.duplicate_matchers",
                    json!({ "pattern_id": id, "existing": existing }),
                );
                return Err(RcaError::DuplicatePattern(format!(
                    "{id} has the same matcher set as {existing}"
                )));
            }
        }

        let entry = Arc::new(entry);
        if !entry.is_retired() {
            state.index(&entry);
        }
        state.entries.insert(id.clone(), entry);
        state.version += 1;
        append_run_log(
            "info",
            "pattern_library.inserted",
            json!({ "pattern_id": id, "version": state.version }),
        );
        Ok(id)
    }

    /// Soft-deletes a pattern: it stops matching but stays in snapshots.
    pub fn retire(&self, pattern_id: &str) -> LibraryResult<()> {
        let mut state = self.write_state()?;
        let entry = state
            .entries
            .get(pattern_id)
            .cloned()
            .ok_or_else(|| RcaError::PatternNotFound(pattern_id.to_string()))?;
        if entry.retired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        state.unindex(&entry);
        state.version += 1;
        append_run_log(
            "info",
            "pattern_library.retired",
            json!({ "pattern_id": pattern_id, "version": state.version }),
        );
        Ok(())
    }

    pub fn get(&self, pattern_id: &str) -> LibraryResult<Option<FailurePattern>> {
        Ok(self
            .read_state()?
            .entries
            .get(pattern_id)
            .map(|entry| entry.snapshot()))
    }

    pub fn entry(&self, pattern_id: &str) -> LibraryResult<Option<Arc<LibraryPattern>>> {
        Ok(self.read_state()?.entries.get(pattern_id).cloned())
    }

    /// Counts one accepted match. Only atomics are touched, so this runs
    /// under the read lock and never blocks concurrent lookups.
    pub fn record_match(&self, pattern_id: &str) -> LibraryResult<u64> {
        let state = self.read_state()?;
        let entry = state
            .entries
            .get(pattern_id)
            .ok_or_else(|| RcaError::PatternNotFound(pattern_id.to_string()))?;
        let count = entry.usage_count.fetch_add(1, Ordering::AcqRel) + 1;
        entry
            .last_matched_at
            .store(self.clock.now_unix_ms(), Ordering::Release);
        Ok(count)
    }

    /// Active patterns whose first rule's index key occurs in the record's
    /// message or top frame, plus patterns that cannot be indexed. A pattern
    /// whose first rule fires on the record is always returned.
    pub fn lookup_candidates(
        &self,
        record: &FailureRecord,
    ) -> LibraryResult<Vec<Arc<LibraryPattern>>> {
        let state = self.read_state()?;
        let mut text = record.message.to_lowercase();
        if let Some(frame) = record.top_frame() {
            text.push('\n');
            text.push_str(&frame.function.to_lowercase());
            text.push('\n');
            text.push_str(&frame.file.to_lowercase());
        }

        let mut ids = state.unindexed.clone();
        for (start, end) in word_spans(&text) {
            let word = &text[start..end];
            if let Some(hits) = state.token_index.get(word) {
                ids.extend(hits.iter().cloned());
            }
            if state.gram_index.is_empty() {
                continue;
            }
            for window in word.as_bytes().windows(GRAM_LEN).filter(|w| w.is_ascii()) {
                let hits = std::str::from_utf8(window)
                    .ok()
                    .and_then(|gram| state.gram_index.get(gram));
                if let Some(hits) = hits {
                    ids.extend(hits.iter().cloned());
                }
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| !entry.is_retired())
            .cloned()
            .collect())
    }

    /// Every pattern, retired ones included, ordered by id.
    pub fn snapshot(&self) -> LibraryResult<Vec<FailurePattern>> {
        Ok(self
            .read_state()?
            .entries
            .values()
            .map(|entry| entry.snapshot())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.state
            .read()
            .map(|state| {
                state
                    .entries
                    .values()
                    .filter(|entry| !entry.is_retired())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn version(&self) -> u64 {
        self.state.read().map(|state| state.version).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::PatternLibrary;
    use crate::errors::RcaError;
    use crate::pattern::{FailurePattern, MatchRule};
    use crate::runtime::FakeClock;
    use crate::types::{FailureCategory, FailureRecord, SourceKind};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn record(message: &str) -> FailureRecord {
        FailureRecord {
            id: "f-0001".to_string(),
            source_kind: SourceKind::Test,
            identifier: "case".to_string(),
            message: message.to_string(),
            trace: Vec::new(),
            context: BTreeMap::new(),
            observed_at: 0,
        }
    }

    fn pattern(id: &str, needle: &str) -> FailurePattern {
        FailurePattern::new(
            id,
            vec![MatchRule::substring(needle)],
            FailureCategory::Infrastructure,
            0.9,
        )
    }

    #[test]
    fn duplicate_matcher_set_is_rejected_without_touching_counters() {
        let library = PatternLibrary::new();
        library.insert(pattern("db-refused", "connection refused")).expect("insert");
        library.record_match("db-refused").expect("match");

        let err = library
            .insert(pattern("db-refused-2", "Connection Refused"))
            .expect_err("duplicate");
        assert!(matches!(err, RcaError::DuplicatePattern(_)));
        let err = library
            .insert(pattern("db-refused", "something else"))
            .expect_err("duplicate id");
        assert!(matches!(err, RcaError::DuplicatePattern(_)));

        let stored = library.get("db-refused").expect("get").expect("present");
        assert_eq!(stored.usage_count, 1);
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn lookup_uses_token_index_and_unindexed_set() {
        let library = PatternLibrary::new();
        library.insert(pattern("db", "connection refused")).expect("db");
        library.insert(pattern("disk", "no space left")).expect("disk");
        library
            .insert(FailurePattern::new(
                "oom-kill",
                vec![MatchRule::key_equals("exit_code", "137")],
                FailureCategory::Environment,
                0.7,
            ))
            .expect("oom");

        let ids = library
            .lookup_candidates(&record("connection refused to db:5432"))
            .expect("lookup")
            .iter()
            .map(|entry| entry.pattern_id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["db".to_string(), "oom-kill".to_string()]);
    }

    #[test]
    fn needles_glued_inside_longer_words_stay_candidates() {
        let library = PatternLibrary::new();
        library.insert(pattern("timeout", "timeout")).expect("timeout");
        library
            .insert(FailurePattern::new(
                "numbered-error",
                vec![MatchRule::regex(r"error\d")],
                FailureCategory::Logic,
                0.6,
            ))
            .expect("regex");
        library.insert(pattern("space", "no space left")).expect("space");

        let ids = |message: &str| {
            library
                .lookup_candidates(&record(message))
                .expect("lookup")
                .iter()
                .map(|entry| entry.pattern_id().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids("java.net.ConnectTimeoutException: db"), vec!["timeout"]);
        assert_eq!(ids("worker exited with error5"), vec!["numbered-error"]);
        assert!(ids("all good").is_empty());

        let entry = library.entry("timeout").expect("entry").expect("present");
        let rec = record("java.net.ConnectTimeoutException: db");
        assert!(entry.rules().iter().all(|rule| rule.fires(&rec)));
    }

    #[test]
    fn retired_patterns_stop_matching_but_remain_in_snapshot() {
        let library = PatternLibrary::new();
        library.insert(pattern("db", "connection refused")).expect("db");
        let before = library.version();
        library.retire("db").expect("retire");
        assert!(library.version() > before);

        assert!(library
            .lookup_candidates(&record("connection refused"))
            .expect("lookup")
            .is_empty());
        let snapshot = library.snapshot().expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].retired);
        assert_eq!(library.active_len(), 0);

        // The matcher set is free again once its owner is retired.
        library.insert(pattern("db-v2", "connection refused")).expect("reinsert");
        assert!(matches!(
            library.retire("missing"),
            Err(RcaError::PatternNotFound(_))
        ));
    }

    #[test]
    fn record_match_updates_counters_with_clock_time() {
        let clock = FakeClock::at_unix_ms(42_000);
        let library = PatternLibrary::with_clock(Arc::new(clock));
        library.insert(pattern("db", "connection refused")).expect("db");
        assert_eq!(library.record_match("db").expect("first"), 1);
        assert_eq!(library.record_match("db").expect("second"), 2);
        let stored = library.get("db").expect("get").expect("present");
        assert_eq!(stored.last_matched_at, Some(42_000));
    }

    #[test]
    fn concurrent_record_match_loses_no_increments() {
        let library = Arc::new(PatternLibrary::new());
        library.insert(pattern("db", "connection refused")).expect("db");
        let handles = (0..8)
            .map(|_| {
                let library = Arc::clone(&library);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        library.record_match("db").expect("match");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(
            library.get("db").expect("get").expect("present").usage_count,
            2_000
        );
    }

    #[test]
    fn unavailable_library_fails_reads_and_writes() {
        let library = PatternLibrary::new();
        library.mark_unavailable("backend down");
        assert!(matches!(
            library.lookup_candidates(&record("x")),
            Err(RcaError::LibraryUnavailable(reason)) if reason == "backend down"
        ));
        assert!(library.insert(pattern("db", "connection refused")).is_err());
        library.mark_available();
        assert!(library.insert(pattern("db", "connection refused")).is_ok());
    }
}
