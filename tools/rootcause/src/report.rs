use crate::errors::RcaError;
use crate::types::AnalysisReport;

pub fn to_json(report: &AnalysisReport) -> Result<String, RcaError> {
    serde_json::to_string_pretty(report).map_err(|e| RcaError::Persistence(e.to_string()))
}

/// Exit status for the command surface: 0 only for a complete run where
/// every failure is explained above `min_finding_confidence`.
pub fn exit_code(report: &AnalysisReport, min_finding_confidence: f64) -> i32 {
    let clean = !report.degraded
        && report.unresolved_failure_ids.is_empty()
        && report.errors.is_empty()
        && report
            .findings
            .iter()
            .all(|finding| finding.confidence >= min_finding_confidence);
    if clean {
        0
    } else {
        1
    }
}

pub fn render_markdown(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str("# Root Cause Analysis\n\n");
    out.push_str(&format!(
        "Analysis `{}`: {} failure(s), {} finding(s), {} ms{}\n\n",
        report.analysis_id,
        report.total_failures,
        report.findings.len(),
        report.duration_ms,
        if report.degraded { " (degraded)" } else { "" }
    ));

    if !report.findings.is_empty() {
        out.push_str("| # | Confidence | Category | Known | Failures | Cause |\n");
        out.push_str("| --- | --- | --- | --- | --- | --- |\n");
        for (idx, finding) in report.findings.iter().enumerate() {
            out.push_str(&format!(
                "| {} | {:.2} | {} | {} | {} | {} |\n",
                idx + 1,
                finding.confidence,
                finding.category.as_str(),
                if finding.is_known_pattern { "yes" } else { "no" },
                finding.member_failure_ids.len(),
                sanitize_cell(&finding.description)
            ));
        }
        out.push('\n');

        for (idx, finding) in report.findings.iter().enumerate() {
            out.push_str(&format!("## {}. {}\n\n", idx + 1, finding.signature));
            if let Some(pattern_id) = &finding.pattern_id {
                out.push_str(&format!("Pattern: `{pattern_id}`\n\n"));
            }
            out.push_str(&format!(
                "Failures: {}\n\n",
                finding.member_failure_ids.join(", ")
            ));
            for step in &finding.remediation_steps {
                out.push_str(&format!("- {}\n", step.replace('\n', " ")));
            }
            out.push('\n');
        }
    }

    if !report.unresolved_failure_ids.is_empty() {
        out.push_str(&format!(
            "Unresolved: {}\n\n",
            report.unresolved_failure_ids.join(", ")
        ));
    }
    if !report.errors.is_empty() {
        out.push_str("| Failure | Error |\n| --- | --- |\n");
        for error in &report.errors {
            out.push_str(&format!(
                "| {} | {} |\n",
                error.failure_id,
                sanitize_cell(&error.reason)
            ));
        }
    }
    out
}

fn sanitize_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
