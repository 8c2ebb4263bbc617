//! xcresulttool adapter.
//!
//! Two query shapes against an `.xcresult` bundle:
//! - the fast summary (`get test-results summary`) used both for readiness
//!   validation and for the final counts, and
//! - the detailed test tree (`get test-results tests`).
//!
//! The tool is normally reached through `xcrun`; a directly-configured
//! `xcresulttool` binary also works.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::DecoderConfig;
use crate::decode::{
    DecodeError, ResultBundleDecoder, ToolInvocation, failure_from_output, run_tool,
};

/// One failure entry from the summary query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SummaryFailure {
    #[serde(alias = "testIdentifier")]
    pub test_name: Option<String>,
    pub target_name: Option<String>,
    #[serde(alias = "failureMessage")]
    pub failure_text: Option<String>,
}

/// The fast summary report.
///
/// `total_test_count` stays `Option` deliberately: a null/absent total is the
/// signal that the bundle is not finished enough to trust, which the
/// readiness protocol treats as "not yet ready" rather than an error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleSummary {
    pub title: Option<String>,
    pub result: Option<String>,
    #[serde(alias = "totalTests")]
    pub total_test_count: Option<u64>,
    #[serde(alias = "passedTestCount")]
    pub passed_tests: u64,
    #[serde(alias = "failedTestCount")]
    pub failed_tests: u64,
    #[serde(alias = "skippedTestCount")]
    pub skipped_tests: u64,
    pub test_failures: Vec<SummaryFailure>,
}

impl BundleSummary {
    /// Readiness well-formedness signal: the bundle has a committed total.
    pub fn is_well_formed(&self) -> bool {
        self.total_test_count.is_some()
    }
}

/// One node of the detailed test tree (plan → bundle → suite → case).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestNode {
    pub name: String,
    pub node_type: Option<String>,
    pub node_identifier: Option<String>,
    pub result: Option<String>,
    pub duration: Option<String>,
    pub children: Vec<TestNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TestTreeReport {
    test_nodes: Vec<TestNode>,
}

pub fn parse_summary(json: &str) -> Result<BundleSummary, DecodeError> {
    if json.trim().is_empty() {
        return Err(DecodeError::Unparseable {
            detail: "summary query produced no output".to_string(),
        });
    }
    serde_json::from_str(json).map_err(|err| DecodeError::Unparseable {
        detail: format!("summary did not parse: {err}"),
    })
}

pub fn parse_test_tree(json: &str) -> Result<Vec<TestNode>, DecodeError> {
    let report: TestTreeReport =
        serde_json::from_str(json).map_err(|err| DecodeError::Unparseable {
            detail: format!("test tree did not parse: {err}"),
        })?;
    Ok(report.test_nodes)
}

/// Result-bundle decoder backed by `xcrun xcresulttool`.
pub struct XcresulttoolDecoder {
    program: String,
    summary_timeout: Duration,
    detail_timeout: Duration,
}

impl XcresulttoolDecoder {
    pub fn new(
        program: impl Into<String>,
        summary_timeout: Duration,
        detail_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            summary_timeout,
            detail_timeout,
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(
            config.xcresulttool.clone(),
            config.summary_timeout(),
            config.decode_timeout(),
        )
    }

    /// `xcrun` needs the `xcresulttool` subcommand prepended; a direct
    /// binary does not.
    fn base_args(&self) -> Vec<String> {
        let is_xcrun = Path::new(&self.program)
            .file_name()
            .is_some_and(|name| name == "xcrun");
        if is_xcrun {
            vec!["xcresulttool".to_string()]
        } else {
            Vec::new()
        }
    }

    fn query(
        &self,
        bundle_path: &Path,
        shape: &str,
        timeout: Duration,
    ) -> Result<String, DecodeError> {
        let bundle = bundle_path.to_string_lossy().to_string();
        let mut args = self.base_args();
        args.extend(
            [
                "get",
                "test-results",
                shape,
                "--path",
                bundle.as_str(),
                "--format",
                "json",
            ]
            .map(str::to_string),
        );
        let output = run_tool(&ToolInvocation {
            program: self.program.clone(),
            args,
            timeout,
        })?;
        if !output.success {
            return Err(failure_from_output(&output));
        }
        Ok(output.stdout)
    }
}

impl ResultBundleDecoder for XcresulttoolDecoder {
    fn summary(&self, bundle_path: &Path) -> Result<BundleSummary, DecodeError> {
        let json = self.query(bundle_path, "summary", self.summary_timeout)?;
        parse_summary(&json)
    }

    fn test_tree(&self, bundle_path: &Path) -> Result<Vec<TestNode>, DecodeError> {
        let json = self.query(bundle_path, "tests", self.detail_timeout)?;
        parse_test_tree(&json)
    }
}
