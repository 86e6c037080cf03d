use crate::matcher::compare_candidates;
use crate::signature::{
    is_stop_word, jaccard, normalize_text, short_fingerprint, token_set, word_spans,
    MIN_TOKEN_LEN,
};
use crate::types::{FailureGroup, FailureRecord, MatchCandidate};
use crate::worker_pool::{StageBudget, StopReason};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;
const BUDGET_CHECK_INTERVAL: usize = 4096;

/// A normalized record together with its ranked match candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRecord {
    pub record: FailureRecord,
    pub candidates: Vec<MatchCandidate>,
}

impl MatchedRecord {
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Grouper {
    similarity_threshold: f64,
}

impl Default for Grouper {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl Grouper {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Partitions `records`: every record lands in exactly one group.
    pub fn group(&self, records: &[MatchedRecord]) -> Vec<FailureGroup> {
        self.group_within(records, &StageBudget::unlimited()).groups
    }

    /// Like `group`, but stops once `budget` runs out. Records whose group
    /// was not finished are returned in `ungrouped`, so `groups` plus
    /// `ungrouped` still cover every record exactly once.
    pub fn group_within(&self, records: &[MatchedRecord], budget: &StageBudget) -> GroupOutcome {
        let mut by_pattern: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        let mut residual = Vec::new();
        for (idx, matched) in records.iter().enumerate() {
            match matched.best() {
                Some(best) => by_pattern.entry(best.pattern_id.as_str()).or_default().push(idx),
                None => residual.push(idx),
            }
        }

        let mut outcome = GroupOutcome {
            groups: by_pattern
                .into_iter()
                .map(|(pattern_id, members)| {
                    let best = members
                        .iter()
                        .filter_map(|idx| records[*idx].best())
                        .min_by(|a, b| compare_candidates(a, b))
                        .cloned();
                    FailureGroup {
                        signature: format!("pattern:{pattern_id}"),
                        member_ids: members.iter().map(|idx| records[*idx].record.id.clone()).collect(),
                        best_candidate: best,
                        common_excerpt: None,
                    }
                })
                .collect(),
            ungrouped: Vec::new(),
            stopped: None,
        };

        let clusters = match self.cluster_residual(records, &residual, budget) {
            Ok(clusters) => clusters,
            Err(reason) => {
                outcome.stopped = Some(reason);
                outcome.ungrouped = residual.iter().map(|idx| records[*idx].record.id.clone()).collect();
                return outcome;
            }
        };
        for (pos, members) in clusters.iter().enumerate() {
            if let Some(reason) = budget.check() {
                outcome.stopped = Some(reason);
                outcome.ungrouped = clusters[pos..]
                    .iter()
                    .flatten()
                    .map(|idx| records[*idx].record.id.clone())
                    .collect();
                break;
            }
            outcome.groups.push(residual_group(records, members));
        }
        outcome
    }

    /// Union-find over records without a match. Candidate pairs come from a
    /// prefix filter: with tokens ordered rarest first, two sets at or above
    /// the threshold always share a token within their first
    /// `prefix_len` tokens, so ubiquitous tokens rarely produce pairs.
    fn cluster_residual(
        &self,
        records: &[MatchedRecord],
        residual: &[usize],
        budget: &StageBudget,
    ) -> Result<Vec<Vec<usize>>, StopReason> {
        let tokens = residual
            .iter()
            .map(|idx| token_set(&records[*idx].record.message))
            .collect::<Vec<_>>();
        let mut sets = DisjointSets::new(residual.len());

        let mut frequency: HashMap<&str, usize> = HashMap::new();
        for set in &tokens {
            for token in set {
                *frequency.entry(token.as_str()).or_default() += 1;
            }
        }

        let mut by_token: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut tokenless: HashMap<String, Vec<usize>> = HashMap::new();
        for (local, set) in tokens.iter().enumerate() {
            if set.is_empty() {
                tokenless
                    .entry(normalize_text(&records[residual[local]].record.message))
                    .or_default()
                    .push(local);
                continue;
            }
            let mut ordered = set.iter().map(String::as_str).collect::<Vec<_>>();
            ordered.sort_by_key(|token| (frequency.get(token).copied().unwrap_or(0), *token));
            for &token in &ordered[..prefix_len(ordered.len(), self.similarity_threshold)] {
                by_token.entry(token).or_default().push(local);
            }
        }

        let mut steps = 0_usize;
        for locals in by_token.values() {
            for (pos, &a) in locals.iter().enumerate() {
                for &b in &locals[pos + 1..] {
                    steps += 1;
                    if steps % BUDGET_CHECK_INTERVAL == 0 {
                        if let Some(reason) = budget.check() {
                            return Err(reason);
                        }
                    }
                    if sets.find(a) == sets.find(b) {
                        continue;
                    }
                    if jaccard(&tokens[a], &tokens[b]) >= self.similarity_threshold {
                        sets.union(a, b);
                    }
                }
            }
        }
        for locals in tokenless.values() {
            for pair in locals.windows(2) {
                sets.union(pair[0], pair[1]);
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for local in 0..residual.len() {
            let root = sets.find(local);
            clusters.entry(root).or_default().push(residual[local]);
        }
        let mut clusters = clusters.into_values().collect::<Vec<_>>();
        clusters.sort_by_key(|members| members[0]);
        Ok(clusters)
    }
}

/// Groups built before the budget ran out, plus the ids left ungrouped.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub groups: Vec<FailureGroup>,
    pub ungrouped: Vec<String>,
    pub stopped: Option<StopReason>,
}

/// Number of rarest tokens a set of `size` tokens is indexed under. Two sets
/// with Jaccard similarity of at least `threshold` share a token within
/// these prefixes.
fn prefix_len(size: usize, threshold: f64) -> usize {
    let required = (threshold * size as f64 - 1e-9).ceil().max(1.0) as usize;
    (size + 1).saturating_sub(required).clamp(1, size.max(1))
}

fn residual_group(records: &[MatchedRecord], members: &[usize]) -> FailureGroup {
    let messages = members
        .iter()
        .map(|idx| records[*idx].record.message.to_lowercase())
        .collect::<Vec<_>>();
    let mut common: Option<BTreeSet<String>> = None;
    for message in &messages {
        let set = token_set(message);
        common = Some(match common {
            Some(acc) => acc.intersection(&set).cloned().collect(),
            None => set,
        });
    }
    let common = common.unwrap_or_default();

    let signature = if common.is_empty() {
        short_fingerprint(&[messages[0].as_str()])
    } else {
        let parts = common.iter().map(String::as_str).collect::<Vec<_>>();
        short_fingerprint(&parts)
    };

    FailureGroup {
        signature: format!("residual:{signature}"),
        member_ids: members.iter().map(|idx| records[*idx].record.id.clone()).collect(),
        best_candidate: None,
        common_excerpt: common_excerpt(&messages, &common),
    }
}

/// Longest stretch of the first message made of shared tokens that appears
/// verbatim (case-insensitively) in every member.
pub fn common_excerpt(lower_messages: &[String], common: &BTreeSet<String>) -> Option<String> {
    let first = lower_messages.first()?;
    let spans = token_spans(first);

    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    let mut run_end = 0;
    let consider = |start: usize, end: usize, best: &mut Option<(usize, usize)>| {
        let excerpt = &first[start..end];
        if lower_messages.iter().all(|message| message.contains(excerpt))
            && best.map_or(true, |(s, e)| end - start > e - s)
        {
            *best = Some((start, end));
        }
    };
    for (start, end) in &spans {
        if common.contains(&first[*start..*end]) {
            run_start.get_or_insert(*start);
            run_end = *end;
        } else if let Some(start) = run_start.take() {
            consider(start, run_end, &mut best);
        }
    }
    if let Some(start) = run_start {
        consider(start, run_end, &mut best);
    }
    if best.is_none() {
        // Fall back to the longest single shared token.
        for (start, end) in &spans {
            if common.contains(&first[*start..*end]) {
                consider(*start, *end, &mut best);
            }
        }
    }
    best.map(|(start, end)| first[start..end].to_string())
}

fn token_spans(text: &str) -> Vec<(usize, usize)> {
    word_spans(text)
        .into_iter()
        .filter(|(start, end)| {
            let token = &text[*start..*end];
            token.chars().count() >= MIN_TOKEN_LEN && !is_stop_word(token)
        })
        .collect()
}

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{common_excerpt, prefix_len, Grouper, MatchedRecord};
    use crate::signature::token_set;
    use crate::types::{FailureRecord, MatchCandidate, SourceKind};
    use crate::worker_pool::{CancellationToken, StageBudget, StopReason};
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Instant;

    fn matched(id: &str, message: &str, pattern: Option<(&str, f64)>) -> MatchedRecord {
        MatchedRecord {
            record: FailureRecord {
                id: id.to_string(),
                source_kind: SourceKind::Test,
                identifier: id.to_string(),
                message: message.to_string(),
                trace: Vec::new(),
                context: BTreeMap::new(),
                observed_at: 0,
            },
            candidates: pattern
                .map(|(pattern_id, confidence)| MatchCandidate {
                    pattern_id: pattern_id.to_string(),
                    matched_rule_count: 1,
                    total_rule_count: 1,
                    confidence,
                    usage_count: 0,
                })
                .into_iter()
                .collect(),
        }
    }

    fn assert_partition(records: &[MatchedRecord], groups: &[crate::types::FailureGroup]) {
        let mut seen = BTreeSet::new();
        for group in groups {
            for id in &group.member_ids {
                assert!(seen.insert(id.clone()), "{id} appears twice");
            }
        }
        let expected = records
            .iter()
            .map(|m| m.record.id.clone())
            .collect::<BTreeSet<_>>();
        assert_eq!(seen, expected);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(Grouper::default().group(&[]).is_empty());
    }

    #[test]
    fn known_patterns_group_by_signature() {
        let records = vec![
            matched("f-1", "connection refused a", Some(("db", 0.9))),
            matched("f-2", "assertion failed", None),
            matched("f-3", "connection refused b", Some(("db", 0.45))),
        ];
        let groups = Grouper::default().group(&records);
        assert_partition(&records, &groups);
        assert_eq!(groups[0].signature, "pattern:db");
        assert_eq!(groups[0].member_ids, vec!["f-1", "f-3"]);
        assert_eq!(groups[0].best_candidate.as_ref().map(|c| c.confidence), Some(0.9));
        assert!(groups[1].signature.starts_with("residual:"));
    }

    #[test]
    fn identical_unmatched_messages_collapse_into_one_cluster() {
        let records = (1..=5)
            .map(|n| matched(&format!("f-{n}"), "AssertionError: expected 3 got 4", None))
            .collect::<Vec<_>>();
        let groups = Grouper::default().group(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_ids.len(), 5);
        assert_eq!(
            groups[0].common_excerpt.as_deref(),
            Some("assertionerror: expected 3 got")
        );
    }

    #[test]
    fn dissimilar_records_stay_singletons_and_similarity_is_transitive() {
        let records = vec![
            matched("f-1", "alpha beta gamma delta", None),
            matched("f-2", "alpha beta gamma epsilon", None),
            matched("f-3", "zeta theta iota kappa", None),
            matched("f-4", "alpha beta gamma epsilon omega", None),
        ];
        let groups = Grouper::new(0.6).group(&records);
        assert_partition(&records, &groups);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].member_ids, vec!["f-1", "f-2", "f-4"]);
        assert_eq!(groups[1].member_ids, vec!["f-3"]);
    }

    #[test]
    fn tokenless_messages_group_only_when_equal() {
        let records = vec![
            matched("f-1", "E1", None),
            matched("f-2", "e1", None),
            matched("f-3", "E2", None),
        ];
        let groups = Grouper::default().group(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].member_ids, vec!["f-1", "f-2"]);
    }

    #[test]
    fn residual_signature_is_stable_across_batches() {
        let first = Grouper::default().group(&[matched("f-1", "disk quota exceeded on /data", None)]);
        let second = Grouper::default().group(&[
            matched("f-9", "unrelated tokens entirely", None),
            matched("f-7", "Disk quota exceeded on /data", None),
        ]);
        assert_eq!(first[0].signature, second[1].signature);
    }

    #[test]
    fn excerpt_falls_back_to_single_token() {
        let messages = vec![
            "timeout while fetching index".to_string(),
            "index fetch hit a timeout".to_string(),
        ];
        let common = token_set(&messages[0])
            .intersection(&token_set(&messages[1]))
            .cloned()
            .collect();
        let excerpt = common_excerpt(&messages, &common);
        assert_eq!(excerpt.as_deref(), Some("timeout"));
    }

    #[test]
    fn prefix_keeps_enough_tokens_to_find_every_similar_pair() {
        assert_eq!(prefix_len(1, 0.6), 1);
        assert_eq!(prefix_len(4, 0.6), 2);
        assert_eq!(prefix_len(5, 0.6), 3);
        assert_eq!(prefix_len(5, 1.0), 1);
    }

    #[test]
    fn a_token_shared_by_every_record_does_not_merge_them() {
        let records = (0..2000)
            .map(|n| matched(&format!("f-{n}"), &format!("error qa{n}x qb{n}y qc{n}z"), None))
            .collect::<Vec<_>>();
        let groups = Grouper::default().group(&records);
        assert_eq!(groups.len(), 2000);
        assert_partition(&records, &groups);
    }

    #[test]
    fn exhausted_budget_leaves_residual_records_ungrouped() {
        let records = vec![
            matched("f-1", "connection refused a", Some(("db", 0.9))),
            matched("f-2", "error qa1x qb1y", None),
            matched("f-3", "error qa2x qb2y", None),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = Grouper::default()
            .group_within(&records, &StageBudget::new(Instant::now(), &cancel));
        assert_eq!(outcome.stopped, Some(StopReason::Cancelled));
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].signature, "pattern:db");
        assert_eq!(outcome.ungrouped, vec!["f-2", "f-3"]);
    }
}
