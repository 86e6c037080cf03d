use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Test,
    Build,
    Infra,
    #[default]
    Unknown,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Build => "build",
            Self::Infra => "infra",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Infrastructure,
    Configuration,
    Logic,
    Dependency,
    Environment,
    #[default]
    Unknown,
}

impl FailureCategory {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "infrastructure" => Some(Self::Infrastructure),
            "configuration" => Some(Self::Configuration),
            "logic" => Some(Self::Logic),
            "dependency" => Some(Self::Dependency),
            "environment" => Some(Self::Environment),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Configuration => "configuration",
            Self::Logic => "logic",
            Self::Dependency => "dependency",
            Self::Environment => "environment",
            Self::Unknown => "unknown",
        }
    }
}

/// One stack frame. Any of the parts may be missing in captured output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Frame {
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
}

impl Frame {
    pub fn render(&self) -> String {
        match self.line {
            Some(line) => format!("{} {}:{}", self.function, self.file, line),
            None => format!("{} {}", self.function, self.file),
        }
        .trim()
        .to_string()
    }
}

/// Raw failure evidence as handed over by a runner adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawFailure {
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Opaque captured output (log excerpt, stderr, stack dump).
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub trace: Vec<Frame>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub observed_at: Option<i64>,
}

/// Canonical, immutable representation of one observed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub source_kind: SourceKind,
    pub identifier: String,
    pub message: String,
    pub trace: Vec<Frame>,
    pub context: BTreeMap<String, String>,
    pub observed_at: i64,
}

impl FailureRecord {
    pub fn top_frame(&self) -> Option<&Frame> {
        self.trace.first()
    }
}

/// Result of scoring one record against one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub pattern_id: String,
    pub matched_rule_count: usize,
    pub total_rule_count: usize,
    pub confidence: f64,
    pub usage_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureGroup {
    pub signature: String,
    pub member_ids: Vec<String>,
    pub best_candidate: Option<MatchCandidate>,
    /// Text shared by every member of a residual cluster.
    pub common_excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseFinding {
    pub signature: String,
    pub category: FailureCategory,
    pub description: String,
    pub confidence: f64,
    pub remediation_steps: Vec<String>,
    pub member_failure_ids: Vec<String>,
    pub is_known_pattern: bool,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub common_excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisError {
    pub failure_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analysis_id: String,
    pub started_at: i64,
    pub duration_ms: u64,
    pub total_failures: usize,
    pub findings: Vec<RootCauseFinding>,
    pub unresolved_failure_ids: Vec<String>,
    pub degraded: bool,
    pub errors: Vec<AnalysisError>,
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
