//! Token extraction and stable fingerprints shared by the library index, the
//! grouper and the learner.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub const MIN_TOKEN_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "and", "are", "but", "can", "could", "for", "from", "had", "has", "have", "into", "its",
    "not", "now", "off", "our", "out", "than", "that", "the", "then", "there", "this", "was",
    "were", "when", "which", "while", "will", "with", "you",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Lower-cased alphanumeric runs of at least three characters, stop-words
/// removed, in order of appearance (duplicates kept).
pub fn token_sequence(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|raw| raw.chars().count() >= MIN_TOKEN_LEN)
        .map(|raw| raw.to_lowercase())
        .filter(|token| !is_stop_word(token))
        .collect()
}

/// Byte ranges of every maximal word run (alphanumerics and `_`), unfiltered.
pub fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (pos, c) in text.char_indices() {
        match (c.is_alphanumeric() || c == '_', start) {
            (true, None) => start = Some(pos),
            (false, Some(s)) => {
                spans.push((s, pos));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

pub fn token_set(text: &str) -> BTreeSet<String> {
    token_sequence(text).into_iter().collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

pub fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub fn fingerprint_hex(parts: &[&str]) -> String {
    let mut digest = Sha256::new();
    for part in parts {
        digest.update((part.len() as u64).to_le_bytes());
        digest.update(part.as_bytes());
    }
    digest
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub fn short_fingerprint(parts: &[&str]) -> String {
    let mut full = fingerprint_hex(parts);
    full.truncate(16);
    full
}
