use crate::errors::RcaError;
use crate::signature::{fingerprint_hex, is_stop_word, word_spans, MIN_TOKEN_LEN};
use crate::types::{FailureCategory, FailureRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Message,
    Trace,
    Context { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRule {
    /// Case-insensitive containment.
    Substring { target: RuleTarget, needle: String },
    Regex { target: RuleTarget, pattern: String },
    /// Exact equality on one context entry.
    KeyEquals { key: String, value: String },
}

impl MatchRule {
    pub fn substring(needle: impl Into<String>) -> Self {
        Self::Substring {
            target: RuleTarget::Message,
            needle: needle.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex {
            target: RuleTarget::Message,
            pattern: pattern.into(),
        }
    }

    pub fn key_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::KeyEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    fn canonical(&self) -> String {
        let target = |target: &RuleTarget| match target {
            RuleTarget::Message => "message".to_string(),
            RuleTarget::Trace => "trace".to_string(),
            RuleTarget::Context { key } => format!("context:{key}"),
        };
        match self {
            Self::Substring { target: t, needle } => {
                format!("substring|{}|{}", target(t), needle.to_lowercase())
            }
            Self::Regex { target: t, pattern } => format!("regex|{}|{pattern}", target(t)),
            Self::KeyEquals { key, value } => format!("key_equals|{key}|{value}"),
        }
    }

    /// The key under which this rule's pattern is indexed. `None` means the
    /// rule cannot be indexed and its pattern is always a candidate.
    ///
    /// A word with a separator on both sides inside the needle must appear
    /// as a whole word in any text the rule fires on, so it becomes a
    /// `Token` key. Words at the needle's edges may be glued to neighbouring
    /// text ("timeout" in "ConnectTimeoutException"), so only their leading
    /// characters are required, as a `Gram` key.
    pub fn index_key(&self) -> Option<IndexKey> {
        let chunks = match self {
            Self::Substring {
                target: RuleTarget::Message,
                needle,
            } => vec![needle.to_lowercase()],
            Self::Regex {
                target: RuleTarget::Message,
                pattern,
            } => regex_literal_chunks(pattern)?
                .iter()
                .map(|chunk| chunk.to_lowercase())
                .collect(),
            _ => return None,
        };

        let mut token: Option<&str> = None;
        let mut gram_source: Option<&str> = None;
        for chunk in &chunks {
            for (start, end) in word_spans(chunk) {
                let word = &chunk[start..end];
                if !word.is_ascii() || word.len() < GRAM_LEN {
                    continue;
                }
                let bounded = start > 0 && end < chunk.len();
                let slot = if bounded && word.len() >= MIN_TOKEN_LEN && !is_stop_word(word) {
                    &mut token
                } else {
                    &mut gram_source
                };
                if slot.map_or(true, |best| word.len() > best.len()) {
                    *slot = Some(word);
                }
            }
        }
        match (token, gram_source) {
            (Some(word), _) => Some(IndexKey::Token(word.to_string())),
            (None, Some(word)) => Some(IndexKey::Gram(word[..GRAM_LEN].to_string())),
            (None, None) => None,
        }
    }
}

pub const GRAM_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// A whole lower-cased word the record text must contain.
    Token(String),
    /// `GRAM_LEN` lower-cased ASCII characters that must appear inside one
    /// of the record's words.
    Gram(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternOrigin {
    #[default]
    Curated,
    Learned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern_id: String,
    pub matchers: Vec<MatchRule>,
    pub category: FailureCategory,
    pub root_cause_template: String,
    pub remediation_steps: Vec<String>,
    pub confidence_base: f64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_matched_at: Option<i64>,
    #[serde(default)]
    pub retired: bool,
    #[serde(default)]
    pub origin: PatternOrigin,
}

impl FailurePattern {
    pub fn new(
        pattern_id: impl Into<String>,
        matchers: Vec<MatchRule>,
        category: FailureCategory,
        confidence_base: f64,
    ) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            matchers,
            category,
            root_cause_template: String::new(),
            remediation_steps: Vec::new(),
            confidence_base,
            usage_count: 0,
            last_matched_at: None,
            retired: false,
            origin: PatternOrigin::Curated,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.root_cause_template = template.into();
        self
    }

    pub fn with_remediation(mut self, steps: &[&str]) -> Self {
        self.remediation_steps = steps.iter().map(|step| step.to_string()).collect();
        self
    }

    /// Order-insensitive fingerprint of the matcher set.
    pub fn matcher_fingerprint(&self) -> String {
        let mut canonical = self
            .matchers
            .iter()
            .map(MatchRule::canonical)
            .collect::<Vec<_>>();
        canonical.sort();
        canonical.dedup();
        let parts = canonical.iter().map(String::as_str).collect::<Vec<_>>();
        fingerprint_hex(&parts)
    }

    pub fn validate(&self) -> Result<(), RcaError> {
        if self.pattern_id.trim().is_empty() {
            return Err(RcaError::InvalidPattern(
                "pattern_id must not be empty".to_string(),
            ));
        }
        if self.matchers.is_empty() {
            return Err(RcaError::InvalidPattern(format!(
                "{}: matchers must not be empty",
                self.pattern_id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_base) {
            return Err(RcaError::InvalidPattern(format!(
                "{}: confidence_base {} outside [0, 1]",
                self.pattern_id, self.confidence_base
            )));
        }
        Ok(())
    }
}

/// A rule with its regex compiled once, at library insertion.
#[derive(Debug, Clone)]
pub enum CompiledRule {
    Substring { target: RuleTarget, needle: String },
    Regex { target: RuleTarget, regex: Regex },
    KeyEquals { key: String, value: String },
}

impl CompiledRule {
    pub fn compile(rule: &MatchRule) -> Result<Self, RcaError> {
        Ok(match rule {
            MatchRule::Substring { target, needle } => {
                if needle.trim().is_empty() {
                    return Err(RcaError::InvalidPattern(
                        "substring needle must not be empty".to_string(),
                    ));
                }
                Self::Substring {
                    target: target.clone(),
                    needle: needle.to_lowercase(),
                }
            }
            MatchRule::Regex { target, pattern } => Self::Regex {
                target: target.clone(),
                regex: Regex::new(pattern)
                    .map_err(|e| RcaError::InvalidPattern(format!("regex {pattern:?}: {e}")))?,
            },
            MatchRule::KeyEquals { key, value } => Self::KeyEquals {
                key: key.clone(),
                value: value.clone(),
            },
        })
    }

    pub fn fires(&self, record: &FailureRecord) -> bool {
        match self {
            Self::Substring { target, needle } => {
                any_target_text(record, target, |text| text.to_lowercase().contains(needle))
            }
            Self::Regex { target, regex } => any_target_text(record, target, |text| regex.is_match(text)),
            Self::KeyEquals { key, value } => record.context.get(key) == Some(value),
        }
    }
}

fn any_target_text(
    record: &FailureRecord,
    target: &RuleTarget,
    mut test: impl FnMut(&str) -> bool,
) -> bool {
    match target {
        RuleTarget::Message => test(&record.message),
        RuleTarget::Trace => record.trace.iter().any(|frame| test(&frame.render())),
        RuleTarget::Context { key } => record.context.get(key).is_some_and(|value| test(value)),
    }
}

/// Runs of literal characters every match of the regex contains. Patterns
/// whose literals might be optional (alternation, repetition, classes,
/// groups) or that use escapes standing for other characters are not
/// indexable.
fn regex_literal_chunks(pattern: &str) -> Option<Vec<String>> {
    if pattern
        .chars()
        .any(|c| matches!(c, '|' | '?' | '*' | '{' | '[' | '('))
    {
        return None;
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        let literal = match c {
            '\\' => match chars.next() {
                Some(escaped) if !escaped.is_alphanumeric() => Some(escaped),
                Some('d' | 'D' | 'w' | 'W' | 's' | 'S' | 'b' | 'B' | 'A' | 'z') => None,
                _ => return None,
            },
            '.' | '^' | '$' | '+' | ')' | ']' | '}' => None,
            other => Some(other),
        };
        match literal {
            Some(c) => current.push(c),
            None if !current.is_empty() => chunks.push(std::mem::take(&mut current)),
            None => {}
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Some(chunks)
}
