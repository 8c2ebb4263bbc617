//! Normalization of decoder output into the public result schema.
//!
//! Decoder reports arrive with optional fields and duplicate entries (one
//! compiler diagnostic can surface once per architecture, for example). The
//! extractor formats entries into stable strings, deduplicates with set
//! semantics while preserving order, and caps very large lists for display
//! without losing the true counts.

use std::collections::HashSet;

use serde::Serialize;

use crate::decode::xclogparser::{IssueEntry, IssueReport};
use crate::decode::xcresulttool::{BundleSummary, TestNode};

/// Placeholder for entries that carry no location data.
const UNKNOWN_LOCATION: &str = "<unknown>";

/// Display cap for issue and failure lists; true counts are always kept.
const DISPLAY_CAP: usize = 25;

/// Structured build outcome: `"<file>[:<line>[:<col>]]: <title>"` strings,
/// ordered and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedBuildResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DecodedBuildResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

fn format_entry(entry: &IssueEntry) -> String {
    let mut location = match entry.file_path() {
        Some(file) => file.to_string(),
        None => UNKNOWN_LOCATION.to_string(),
    };
    if entry.file_path().is_some() {
        if let Some(line) = entry.starting_line_number {
            location.push_str(&format!(":{line}"));
            if let Some(column) = entry.starting_column_number {
                location.push_str(&format!(":{column}"));
            }
        }
    }
    format!("{location}: {}", entry.message())
}

fn normalize_entries(entries: &[IssueEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(format_entry)
        .filter(|formatted| seen.insert(formatted.clone()))
        .collect()
}

/// Normalize an issues report into the public schema.
pub fn normalize_issues(report: &IssueReport) -> DecodedBuildResult {
    DecodedBuildResult {
        errors: normalize_entries(&report.errors),
        warnings: normalize_entries(&report.warnings),
    }
}

/// One failing test with its message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestFailure {
    pub test: String,
    pub message: String,
}

/// Structured test outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestResultSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub failures: Vec<TestFailure>,
}

/// Normalize a verified bundle summary into the public schema.
pub fn summarize_bundle(summary: &BundleSummary) -> TestResultSummary {
    let mut seen = HashSet::new();
    let failures = summary
        .test_failures
        .iter()
        .map(|failure| TestFailure {
            test: failure
                .test_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
            message: failure
                .failure_text
                .clone()
                .unwrap_or_else(|| "(no failure text)".to_string()),
        })
        .filter(|failure| seen.insert((failure.test.clone(), failure.message.clone())))
        .collect();

    TestResultSummary {
        total: summary.total_test_count.unwrap_or_default(),
        passed: summary.passed_tests,
        failed: summary.failed_tests,
        skipped: summary.skipped_tests,
        failures,
    }
}

/// Failing test cases pulled out of the detailed node tree, for bundles
/// whose summary omits failure entries.
pub fn failures_from_tree(nodes: &[TestNode]) -> Vec<TestFailure> {
    fn walk(node: &TestNode, out: &mut Vec<TestFailure>) {
        let is_case = node
            .node_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("test case"));
        let failed = node
            .result
            .as_deref()
            .is_some_and(|result| result.eq_ignore_ascii_case("failed"));
        if is_case && failed {
            out.push(TestFailure {
                test: node
                    .node_identifier
                    .clone()
                    .unwrap_or_else(|| node.name.clone()),
                message: "failed (see detailed results)".to_string(),
            });
        }
        for child in &node.children {
            walk(child, out);
        }
    }

    let mut out = Vec::new();
    for node in nodes {
        walk(node, &mut out);
    }
    out
}

fn push_capped_list(output: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    output.push_str(&format!("{label}:\n"));
    for item in items.iter().take(DISPLAY_CAP) {
        output.push_str(&format!("  {item}\n"));
    }
    if items.len() > DISPLAY_CAP {
        output.push_str(&format!(
            "  ... {} more not shown\n",
            items.len() - DISPLAY_CAP
        ));
    }
}

/// Human-readable build report.
pub fn format_build_result(result: &DecodedBuildResult) -> String {
    let mut output = format!(
        "Build {}: {} error(s), {} warning(s)\n",
        if result.succeeded() { "succeeded" } else { "failed" },
        result.errors.len(),
        result.warnings.len()
    );
    push_capped_list(&mut output, "Errors", &result.errors);
    push_capped_list(&mut output, "Warnings", &result.warnings);
    output
}

/// Human-readable test report.
pub fn format_test_summary(summary: &TestResultSummary) -> String {
    let mut output = format!(
        "Tests: {} total, {} passed, {} failed, {} skipped\n",
        summary.total, summary.passed, summary.failed, summary.skipped
    );
    let failures: Vec<String> = summary
        .failures
        .iter()
        .map(|failure| format!("{}: {}", failure.test, failure.message))
        .collect();
    push_capped_list(&mut output, "Failures", &failures);
    output
}
