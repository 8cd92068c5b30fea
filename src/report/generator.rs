//! Markdown and JSON report generation.
//!
//! Renders a finished run, with its per-analyzer details, into a document
//! meant for a human reader or for piping into other tools.

use crate::models::{fields, Contribution, FinalResult, RunStatus, Synthesis, WorkerId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// How a report came to be.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub provider: String,
    pub synthesizer: String,
    pub generated_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// A final result plus the context it was produced in.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub result: FinalResult,
}

impl Report {
    /// Process exit code for this report: 0 unless the run failed outright.
    pub fn exit_code(&self) -> i32 {
        match self.result.status {
            RunStatus::Complete | RunStatus::Partial => 0,
            RunStatus::Failed => 1,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();
    let result = &report.result;

    output.push_str(&format!("# Tradeflow Report: {}\n\n", result.symbol));

    output.push_str(&generate_metadata_section(report));

    if let Some(ref error) = result.error {
        output.push_str(&format!("> ⚠️ **{}:** {}\n\n", result.status, error));
    }

    match result.narrative {
        Some(ref synthesis) => output.push_str(&generate_synthesis_section(synthesis)),
        None if result.status == RunStatus::Failed => {
            output.push_str("## Summary\n\nThe run failed before any analysis could be done.\n\n")
        }
        None => output.push_str("## Summary\n\nNo narrative could be synthesized for this run.\n\n"),
    }

    output.push_str(&generate_contributions_section(&result.details));

    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(report: &Report) -> String {
    let result = &report.result;
    let metadata = &report.metadata;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Symbol:** {}\n", result.symbol));
    if !result.query.is_empty() {
        section.push_str(&format!("- **Question:** {}\n", result.query));
    }
    section.push_str(&format!(
        "- **Status:** {} {}\n",
        status_badge(result.status),
        result.status
    ));
    section.push_str(&format!("- **Run:** {}\n", result.run_id));
    section.push_str(&format!(
        "- **Completed:** {}\n",
        result.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Data Provider:** `{}`\n", metadata.provider));
    section.push_str(&format!("- **Synthesizer:** `{}`\n", metadata.synthesizer));
    section.push_str(&format!(
        "- **Analyzers:** {} succeeded, {} failed or missing\n",
        result.completed_count(),
        result.failed_count()
    ));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn status_badge(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Complete => "🟢",
        RunStatus::Partial => "🟡",
        RunStatus::Failed => "🔴",
    }
}

/// Generate the narrative sections.
fn generate_synthesis_section(synthesis: &Synthesis) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    if synthesis.summary.is_empty() {
        section.push_str("*No summary was provided.*\n\n");
    } else {
        section.push_str(&synthesis.summary);
        section.push_str("\n\n");
    }
    if !synthesis.confidence_level.is_empty() {
        section.push_str(&format!(
            "**Confidence:** {}\n\n",
            synthesis.confidence_level
        ));
    }

    section.push_str(&bullet_list("Key Insights", &synthesis.key_insights));
    section.push_str(&numbered_list("Recommendations", &synthesis.recommendations));
    section.push_str(&bullet_list("Risks", &synthesis.risks));
    section.push_str(&numbered_list("Next Steps", &synthesis.next_steps));

    section
}

fn bullet_list(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut section = format!("### {}\n\n", title);
    for item in items {
        section.push_str(&format!("- {}\n", item));
    }
    section.push('\n');
    section
}

fn numbered_list(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut section = format!("### {}\n\n", title);
    for (i, item) in items.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, item));
    }
    section.push('\n');
    section
}

/// Generate the per-analyzer details.
fn generate_contributions_section(details: &BTreeMap<WorkerId, Contribution>) -> String {
    let mut section = String::new();

    section.push_str("## Analyzer Details\n\n");

    if details.is_empty() {
        section.push_str("No analyzers took part in this run.\n\n");
        return section;
    }

    for (worker, contribution) in details {
        section.push_str(&format!("### {}\n\n", title_case(worker)));
        match contribution {
            Contribution::Completed { fields } => {
                let rows: Vec<_> = fields
                    .iter()
                    .filter(|(key, _)| !is_bookkeeping(key))
                    .collect();
                if rows.is_empty() {
                    section.push_str("*Completed without findings.*\n\n");
                    continue;
                }
                section.push_str("| Metric | Value |\n");
                section.push_str("|:---|:---|\n");
                for (key, value) in rows {
                    section.push_str(&format!("| {} | {} |\n", key, render_value(value)));
                }
                section.push('\n');
            }
            Contribution::Failed { cause } => {
                section.push_str(&format!("> 🔴 **Failed:** {}\n\n", cause));
            }
            Contribution::Missing => {
                section.push_str("> 🟡 **Missing:** no result arrived before the deadline.\n\n");
            }
        }
    }

    section
}

/// Correlation and routing fields echoed by every analyzer.
fn is_bookkeeping(key: &str) -> bool {
    fields::CORRELATION.contains(&key) || key == fields::AGENT_TYPE
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "n/a".to_string(),
        Value::String(s) => s.replace('|', "\\|"),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{:.4}", f),
            _ => n.to_string(),
        },
        other => other.to_string().replace('|', "\\|"),
    }
}

/// `technical_analyzer` → `Technical Analyzer`.
fn title_case(id: &str) -> String {
    id.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str("*Generated by tradeflow. Not investment advice.*\n");

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
