//! Environment health checks.
//!
//! Verifies the external collaborators before a monitoring run is attempted:
//! the decoders must respond and the DerivedData root must exist. Each check
//! carries a remediation hint so a failing report is actionable.

use std::path::Path;
use std::time::Duration;

use crate::config::ReapConfig;
use crate::decode::{DecodeError, ToolInvocation, run_tool};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
    pub remediation: Option<&'static str>,
}

#[derive(Debug)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }
}

fn probe_tool(
    name: &'static str,
    program: &str,
    args: Vec<String>,
    remediation: &'static str,
) -> DoctorCheck {
    match run_tool(&ToolInvocation {
        program: program.to_string(),
        args,
        timeout: PROBE_TIMEOUT,
    }) {
        Ok(output) if output.success => DoctorCheck {
            name,
            passed: true,
            detail: output.stdout.trim().lines().next().unwrap_or("ok").to_string(),
            remediation: None,
        },
        Ok(output) => DoctorCheck {
            name,
            passed: false,
            detail: format!(
                "exited with {:?}: {}",
                output.exit_code,
                output.diagnostic_text().trim()
            ),
            remediation: Some(remediation),
        },
        Err(DecodeError::ToolMissing { detail, .. }) => DoctorCheck {
            name,
            passed: false,
            detail,
            remediation: Some(remediation),
        },
        Err(err) => DoctorCheck {
            name,
            passed: false,
            detail: err.to_string(),
            remediation: Some(remediation),
        },
    }
}

fn check_derived_data_root(config: &ReapConfig) -> DoctorCheck {
    match config.locator.root() {
        Ok(root) if root.is_dir() => DoctorCheck {
            name: "derived-data-root",
            passed: true,
            detail: root.display().to_string(),
            remediation: None,
        },
        Ok(root) => DoctorCheck {
            name: "derived-data-root",
            passed: false,
            detail: format!("{} does not exist", root.display()),
            remediation: Some(
                "run a build in Xcode once, or point locator.derived_data_root at the right place",
            ),
        },
        Err(err) => DoctorCheck {
            name: "derived-data-root",
            passed: false,
            detail: err.to_string(),
            remediation: Some("set locator.derived_data_root in .xcreap/config.toml"),
        },
    }
}

/// Run all environment checks.
pub fn run_doctor(config: &ReapConfig) -> DoctorReport {
    let xcresulttool_args = if Path::new(&config.decoder.xcresulttool)
        .file_name()
        .is_some_and(|name| name == "xcrun")
    {
        vec!["xcresulttool".to_string(), "version".to_string()]
    } else {
        vec!["version".to_string()]
    };

    DoctorReport {
        checks: vec![
            check_derived_data_root(config),
            probe_tool(
                "xclogparser",
                &config.decoder.xclogparser,
                vec!["version".to_string()],
                "install xclogparser (`brew install xclogparser`)",
            ),
            probe_tool(
                "xcresulttool",
                &config.decoder.xcresulttool,
                xcresulttool_args,
                "install Xcode command line tools (`xcode-select --install`)",
            ),
        ],
    }
}

/// Human-readable report.
pub fn format_doctor_report(report: &DoctorReport) -> String {
    let mut output = String::new();
    for check in &report.checks {
        let mark = if check.passed { "ok" } else { "FAIL" };
        output.push_str(&format!("[{mark:>4}] {:<20} {}\n", check.name, check.detail));
        if let Some(remediation) = check.remediation {
            output.push_str(&format!("       hint: {remediation}\n"));
        }
    }
    output.push_str(if report.all_passed() {
        "\nEnvironment looks healthy.\n"
    } else {
        "\nSome checks failed; monitoring may not work until they are fixed.\n"
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tools_fail_with_remediation() {
        let mut config = ReapConfig::default();
        config.locator.derived_data_root = Some("/definitely/not/a/real/path".into());
        config.decoder.xclogparser = "xcreap-test-missing-xclogparser".to_string();
        config.decoder.xcresulttool = "xcreap-test-missing-xcresulttool".to_string();

        let report = run_doctor(&config);
        assert!(!report.all_passed());
        assert_eq!(report.checks.len(), 3);
        for check in &report.checks {
            assert!(!check.passed);
            assert!(check.remediation.is_some());
        }
    }

    #[test]
    fn existing_root_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ReapConfig::default();
        config.locator.derived_data_root = Some(tmp.path().to_path_buf());

        let check = check_derived_data_root(&config);
        assert!(check.passed);
    }

    #[test]
    fn probe_uses_tool_output_first_line() {
        // `sh -c 'echo ...'` stands in for a healthy decoder.
        let check = probe_tool(
            "stub",
            "sh",
            vec!["-c".to_string(), "echo 'stub 1.2.3'".to_string()],
            "unused",
        );
        assert!(check.passed);
        assert_eq!(check.detail, "stub 1.2.3");
    }

    #[test]
    fn report_formatting_includes_hints_on_failure() {
        let report = DoctorReport {
            checks: vec![DoctorCheck {
                name: "xclogparser",
                passed: false,
                detail: "not found".to_string(),
                remediation: Some("install it"),
            }],
        };
        let text = format_doctor_report(&report);
        assert!(text.contains("FAIL"));
        assert!(text.contains("hint: install it"));
        assert!(text.contains("Some checks failed"));
    }
}
