use crate::errors::RcaError;
use crate::pattern_library::PatternLibrary;
use crate::types::{clamp_confidence, FailureCategory, FailureGroup, FailureRecord, RootCauseFinding};
use std::collections::BTreeSet;

pub const DEFAULT_MAX_GROUP_SIZE: usize = 500;
pub const HEURISTIC_FIRST_HIT: f64 = 0.25;
pub const HEURISTIC_EXTRA_HIT: f64 = 0.05;
pub const HEURISTIC_CAP: f64 = 0.4;
pub const HEURISTIC_NO_HIT: f64 = 0.1;

const MANUAL_STEP: &str = "Investigate the failure manually";
const PARITY_STEP: &str = "Check environment parity between local and CI";
const DESCRIPTION_EXCERPT_CHARS: usize = 160;

/// Keyword sets in priority order; on equal hit counts the earlier
/// category wins.
const KEYWORDS: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::Infrastructure,
        &[
            "connection refused",
            "timed out",
            "timeout",
            "network",
            "unreachable",
            "dns",
            "econnreset",
            "socket",
            "broken pipe",
            "503",
        ],
    ),
    (
        FailureCategory::Dependency,
        &[
            "version",
            "unresolved import",
            "cannot find crate",
            "module not found",
            "package",
            "dependency",
            "linker",
        ],
    ),
    (
        FailureCategory::Configuration,
        &[
            "no such file",
            "not found",
            "missing",
            "enoent",
            "permission denied",
            "config",
            "environment variable",
        ],
    ),
    (
        FailureCategory::Environment,
        &[
            "out of memory",
            "oom",
            "disk full",
            "no space left",
            "killed",
            "signal",
        ],
    ),
    (
        FailureCategory::Logic,
        &[
            "assert",
            "assertion",
            "expected",
            "panicked",
            "null pointer",
            "index out of bounds",
        ],
    ),
];

pub fn category_hint(category: FailureCategory) -> Option<&'static str> {
    match category {
        FailureCategory::Infrastructure => {
            Some("Check network connectivity and availability of the services the job talks to")
        }
        FailureCategory::Configuration => {
            Some("Verify configuration files, paths and environment variables")
        }
        FailureCategory::Dependency => Some("Verify dependency versions and lockfile consistency"),
        FailureCategory::Environment => Some("Check memory and disk limits on the runner"),
        FailureCategory::Logic => Some("Review the failing assertion against recent code changes"),
        FailureCategory::Unknown => None,
    }
}

/// Category guess for unmatched text along with the number of distinct
/// keywords that supported it.
pub fn classify_messages<'a>(messages: impl IntoIterator<Item = &'a str>) -> (FailureCategory, usize) {
    let lowered = messages
        .into_iter()
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
    let mut best = (FailureCategory::Unknown, 0);
    for (category, keywords) in KEYWORDS {
        let hits = keywords
            .iter()
            .filter(|keyword| lowered.iter().any(|message| message.contains(*keyword)))
            .count();
        if hits > best.1 {
            best = (*category, hits);
        }
    }
    best
}

pub fn heuristic_confidence(hits: usize) -> f64 {
    if hits == 0 {
        return HEURISTIC_NO_HIT;
    }
    let extra = (hits - 1) as f64 * HEURISTIC_EXTRA_HIT;
    (HEURISTIC_FIRST_HIT + extra).min(HEURISTIC_CAP)
}

#[derive(Debug, Clone, Copy)]
pub struct Inferencer {
    max_group_size: usize,
}

impl Default for Inferencer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GROUP_SIZE)
    }
}

impl Inferencer {
    pub fn new(max_group_size: usize) -> Self {
        Self {
            max_group_size: max_group_size.max(1),
        }
    }

    /// `members` holds the group's records in member order. Every group
    /// yields exactly one finding.
    pub fn infer(
        &self,
        group: &FailureGroup,
        members: &[&FailureRecord],
        library: &PatternLibrary,
    ) -> Result<RootCauseFinding, RcaError> {
        let member_failure_ids = group
            .member_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let sample = sample_evenly(members, self.max_group_size);

        if let Some(candidate) = &group.best_candidate {
            if let Some(entry) = library.entry(&candidate.pattern_id)? {
                let pattern = entry.definition();
                let description = match sample.first() {
                    Some(record) if !pattern.root_cause_template.trim().is_empty() => {
                        fill_template(&pattern.root_cause_template, record)
                    }
                    _ => format!(
                        "{} failure matching pattern {}",
                        pattern.category.as_str(),
                        pattern.pattern_id
                    ),
                };
                return Ok(RootCauseFinding {
                    signature: group.signature.clone(),
                    category: pattern.category,
                    description,
                    confidence: clamp_confidence(candidate.confidence),
                    remediation_steps: pattern.remediation_steps.clone(),
                    member_failure_ids,
                    is_known_pattern: true,
                    pattern_id: Some(pattern.pattern_id.clone()),
                    common_excerpt: None,
                });
            }
        }

        let (category, hits) = classify_messages(sample.iter().map(|record| record.message.as_str()));
        let mut remediation_steps = Vec::new();
        if let Some(hint) = category_hint(category) {
            remediation_steps.push(hint.to_string());
        }
        remediation_steps.push(MANUAL_STEP.to_string());
        remediation_steps.push(PARITY_STEP.to_string());

        let shown = group
            .common_excerpt
            .clone()
            .or_else(|| sample.first().map(|record| record.message.clone()))
            .unwrap_or_default();
        let description = format!(
            "Unrecognized {} failure in {} record(s): {}",
            category.as_str(),
            member_failure_ids.len(),
            shorten(&shown, DESCRIPTION_EXCERPT_CHARS)
        );

        Ok(RootCauseFinding {
            signature: group.signature.clone(),
            category,
            description,
            confidence: heuristic_confidence(hits),
            remediation_steps,
            member_failure_ids,
            is_known_pattern: false,
            pattern_id: None,
            common_excerpt: group.common_excerpt.clone(),
        })
    }
}

/// Evenly strided sample of at most `max` items, always including the first.
pub fn sample_evenly<'a, T>(items: &[&'a T], max: usize) -> Vec<&'a T> {
    if items.len() <= max {
        return items.to_vec();
    }
    let stride = items.len() as f64 / max as f64;
    (0..max)
        .map(|i| items[((i as f64 * stride) as usize).min(items.len() - 1)])
        .collect()
}

/// Replaces `{key}` with the record's context value, or with the built-ins
/// `identifier` and `source_kind`. Unknown keys render as `unknown`.
pub fn fill_template(template: &str, record: &FailureRecord) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                let value = match key {
                    "identifier" => record.identifier.as_str(),
                    "source_kind" => record.source_kind.as_str(),
                    _ => record.context.get(key).map(String::as_str).unwrap_or("unknown"),
                };
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut short = text.chars().take(max_chars).collect::<String>();
    short.push_str("...");
    short
}
