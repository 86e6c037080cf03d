use crate::errors::RcaError;
use crate::types::{FailureRecord, Frame, RawFailure};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4096;
pub const DEFAULT_MAX_TRACE_FRAMES: usize = 200;

const BOUNDARY_MARKERS: &[&str] = &[
    "error",
    "panicked",
    "exception",
    "failed",
    "failure",
    "fatal",
    "assert",
    "traceback",
    "refused",
    "timed out",
    "timeout",
    "segmentation fault",
    "abort",
];

// Each prefix must start a path: `lead` is the start of text or a character
// that cannot continue a path, and is put back on replacement.
#[allow(clippy::expect_used)]
static MACHINE_PREFIXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/home/[^/\s]+/",
        r"/Users/[^/\s]+/",
        r"(?i:[a-z]):\\Users\\[^\\\s]+\\",
        r"/(?:private/)?var/folders/[^/\s]+/[^/\s]+/(?:T/)?",
        r"/tmp/[^/\s]+/",
        r"/root/",
    ]
    .iter()
    .map(|prefix| {
        Regex::new(&format!(r"(?P<lead>^|[^\w/\\.~-]){prefix}"))
            .expect("valid machine prefix regex")
    })
    .collect()
});

// at fn (file:12:3) | at pkg.Class.method(File.java:42)
#[allow(clippy::expect_used)]
static AT_CALL_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?P<func>[^\s(]+)\s*\((?P<file>[^)]+?):(?P<line>\d+)(?::\d+)?\)\s*$")
        .expect("valid frame regex")
});

// at file:12:3 (anonymous frame, or the location line of a rust backtrace)
#[allow(clippy::expect_used)]
static AT_LOCATION_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?P<file>[^\s()]+?):(?P<line>\d+)(?::\d+)?\s*$")
        .expect("valid frame regex")
});

#[allow(clippy::expect_used)]
static PYTHON_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<func>\S+))?"#)
        .expect("valid frame regex")
});

#[allow(clippy::expect_used)]
static NUMBERED_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+:\s+(?P<func>\S+)\s*$").expect("valid frame regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub max_message_bytes: usize,
    pub max_trace_frames: usize,
    /// Extra machine-specific prefixes (workspace roots, CI checkout dirs).
    pub strip_prefixes: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_trace_frames: DEFAULT_MAX_TRACE_FRAMES,
            strip_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

#[derive(Debug, Default)]
struct ParsedBlob {
    boundary: Option<String>,
    frames: Vec<Frame>,
}

impl Normalizer {
    pub fn new(mut config: NormalizerConfig) -> Self {
        config.strip_prefixes.retain(|prefix| !prefix.is_empty());
        // Longest first so nested prefixes strip completely.
        config
            .strip_prefixes
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn normalize(
        &self,
        id: &str,
        raw: &RawFailure,
        now_ms: i64,
    ) -> Result<FailureRecord, RcaError> {
        let parsed = raw
            .text
            .as_deref()
            .map(parse_blob)
            .unwrap_or_default();

        let identifier = raw
            .identifier
            .as_deref()
            .map(collapse_whitespace)
            .filter(|value| !value.is_empty());

        let context = raw
            .context
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| {
                (
                    key.trim().to_string(),
                    self.canonicalize(&collapse_whitespace(value)),
                )
            })
            .collect::<BTreeMap<_, _>>();

        let raw_frames = if raw.trace.is_empty() {
            parsed.frames
        } else {
            raw.trace.clone()
        };
        let trace = self.normalize_frames(raw_frames);

        let explicit = raw
            .message
            .as_deref()
            .map(|message| self.canonicalize(&collapse_whitespace(message)))
            .filter(|message| !message.is_empty());
        let from_blob = parsed
            .boundary
            .map(|line| self.canonicalize(&collapse_whitespace(&line)))
            .filter(|message| !message.is_empty());

        let message = match explicit.or(from_blob) {
            Some(message) => message,
            None => {
                if identifier.is_none() && trace.is_empty() && context.is_empty() {
                    return Err(RcaError::Normalization(format!(
                        "{id}: input has no parseable failure boundary"
                    )));
                }
                synthesize_message(identifier.as_deref(), raw, &trace, &context)
            }
        };

        Ok(FailureRecord {
            id: id.to_string(),
            source_kind: raw.source_kind,
            identifier: identifier.unwrap_or_else(|| derive_identifier(&trace, &context)),
            message: truncate_bytes(&message, self.config.max_message_bytes),
            trace,
            context,
            observed_at: raw.observed_at.unwrap_or(now_ms),
        })
    }

    /// Strips machine-specific path prefixes so the same failure on two hosts
    /// normalizes to the same text.
    pub fn canonicalize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for prefix in &self.config.strip_prefixes {
            out = out.replace(prefix.as_str(), "");
        }
        for pattern in MACHINE_PREFIXES.iter() {
            out = pattern.replace_all(&out, "${lead}").into_owned();
        }
        out
    }

    fn normalize_frames(&self, frames: Vec<Frame>) -> Vec<Frame> {
        let mut out: Vec<Frame> = Vec::with_capacity(frames.len().min(self.config.max_trace_frames));
        for frame in frames {
            let frame = Frame {
                function: collapse_whitespace(&frame.function),
                file: self.canonicalize(frame.file.trim()),
                line: frame.line,
            };
            if frame.function.is_empty() && frame.file.is_empty() {
                continue;
            }
            if out.last() == Some(&frame) {
                continue;
            }
            if out.len() == self.config.max_trace_frames {
                break;
            }
            out.push(frame);
        }
        out
    }
}

fn parse_blob(text: &str) -> ParsedBlob {
    let mut parsed = ParsedBlob::default();
    let mut traceback_seen = false;
    let mut last_plain_line: Option<&str> = None;

    for line in text.lines() {
        if let Some(caps) = AT_CALL_FRAME.captures(line) {
            parsed.frames.push(Frame {
                function: caps["func"].to_string(),
                file: caps["file"].to_string(),
                line: caps["line"].parse().ok(),
            });
            continue;
        }
        if let Some(caps) = AT_LOCATION_FRAME.captures(line) {
            let file = caps["file"].to_string();
            let line_no = caps["line"].parse().ok();
            match parsed.frames.last_mut() {
                Some(last) if last.file.is_empty() => {
                    last.file = file;
                    last.line = line_no;
                }
                _ => parsed.frames.push(Frame {
                    function: String::new(),
                    file,
                    line: line_no,
                }),
            }
            continue;
        }
        if let Some(caps) = PYTHON_FRAME.captures(line) {
            parsed.frames.push(Frame {
                function: caps
                    .name("func")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                file: caps["file"].to_string(),
                line: caps["line"].parse().ok(),
            });
            continue;
        }
        if let Some(caps) = NUMBERED_FRAME.captures(line) {
            parsed.frames.push(Frame {
                function: caps["func"].to_string(),
                file: String::new(),
                line: None,
            });
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        last_plain_line = Some(trimmed);
        let lower = trimmed.to_lowercase();
        if lower.starts_with("traceback") {
            traceback_seen = true;
            continue;
        }
        if parsed.boundary.is_none() && BOUNDARY_MARKERS.iter().any(|marker| lower.contains(marker)) {
            parsed.boundary = Some(trimmed.to_string());
        }
    }

    // Python prints the exception after the frames.
    if traceback_seen {
        if let Some(last) = last_plain_line {
            parsed.boundary = Some(last.to_string());
        }
    }
    parsed
}

fn synthesize_message(
    identifier: Option<&str>,
    raw: &RawFailure,
    trace: &[Frame],
    context: &BTreeMap<String, String>,
) -> String {
    let subject = match identifier {
        Some(identifier) => identifier.to_string(),
        None => match trace.first() {
            Some(frame) => frame.render(),
            None => format!("{} step", raw.source_kind.as_str()),
        },
    };
    if context.is_empty() {
        return format!("{subject} failed");
    }
    let details = context
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{subject} failed ({details})")
}

fn derive_identifier(trace: &[Frame], context: &BTreeMap<String, String>) -> String {
    if let Some(command) = context.get("command").filter(|value| !value.is_empty()) {
        return command.clone();
    }
    trace
        .first()
        .map(|frame| frame.function.clone())
        .filter(|function| !function.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_bytes(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value[..cut].to_string()
}
