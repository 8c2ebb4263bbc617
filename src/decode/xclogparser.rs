//! xclogparser adapter.
//!
//! `xclogparser parse --file <log> --reporter issues` reads a compressed
//! `.xcactivitylog` and emits a JSON issues report. The report's fields are
//! optionally shaped (location data may be absent, and some fields have
//! grown synonyms across releases), so everything goes through one
//! validating serde parse with defaults and aliases.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::DecoderConfig;
use crate::decode::{
    BuildLogDecoder, DecodeError, ToolInvocation, failure_from_output, run_tool,
};

/// One error or warning entry from the issues report.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IssueEntry {
    #[serde(alias = "documentURL")]
    pub document_url: Option<String>,
    #[serde(alias = "line")]
    pub starting_line_number: Option<u64>,
    #[serde(alias = "column")]
    pub starting_column_number: Option<u64>,
    pub title: Option<String>,
    pub detail: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: Option<String>,
}

impl IssueEntry {
    /// File path with the `file://` scheme stripped, if the entry has one.
    pub fn file_path(&self) -> Option<&str> {
        let url = self.document_url.as_deref()?;
        if url.is_empty() {
            return None;
        }
        Some(url.strip_prefix("file://").unwrap_or(url))
    }

    /// Best available message text.
    pub fn message(&self) -> &str {
        self.title
            .as_deref()
            .or(self.detail.as_deref())
            .unwrap_or("(no title)")
    }
}

/// The full issues report: ordered error and warning collections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IssueReport {
    pub errors: Vec<IssueEntry>,
    pub warnings: Vec<IssueEntry>,
}

/// Parse the issues JSON. A parse failure is `Unparseable` (and therefore
/// retried): a decoder racing a partial artifact can emit truncated JSON
/// with a zero exit status.
pub fn parse_issue_report(json: &str) -> Result<IssueReport, DecodeError> {
    if json.trim().is_empty() {
        return Err(DecodeError::Unparseable {
            detail: "decoder produced no output".to_string(),
        });
    }
    serde_json::from_str(json).map_err(|err| DecodeError::Unparseable {
        detail: format!("issues report did not parse: {err}"),
    })
}

/// Build-log decoder backed by the `xclogparser` CLI.
pub struct XclogparserDecoder {
    program: String,
    timeout: Duration,
}

impl XclogparserDecoder {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(config.xclogparser.clone(), config.decode_timeout())
    }
}

impl BuildLogDecoder for XclogparserDecoder {
    fn decode_issues(&self, log_path: &Path) -> Result<IssueReport, DecodeError> {
        let output = run_tool(&ToolInvocation {
            program: self.program.clone(),
            args: vec![
                "parse".to_string(),
                "--file".to_string(),
                log_path.to_string_lossy().to_string(),
                "--reporter".to_string(),
                "issues".to_string(),
            ],
            timeout: self.timeout,
        })?;

        if !output.success {
            return Err(failure_from_output(&output));
        }
        parse_issue_report(&output.stdout)
    }
}
