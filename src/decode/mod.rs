//! External decoder invocation.
//!
//! The artifacts' internal formats are never parsed here; decoding is
//! delegated to external tools (`xclogparser` for build logs, `xcresulttool`
//! for result bundles) wrapped in adapters. This module owns the pieces the
//! adapters share: running a tool with a hard timeout, classifying failures,
//! and the transient-corruption retry loop.
//!
//! A decoder that reads an artifact moments too early tends to report it as
//! corrupt; that is expected, not fatal. Corruption-shaped failures are
//! retried on a growing backoff. Everything else fails fast.

pub mod xclogparser;
pub mod xcresulttool;

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{FailureClass, MonitorError};

use xclogparser::IssueReport;
use xcresulttool::{BundleSummary, TestNode};

/// Diagnostic substrings that mean "the artifact was not fully written yet".
const TRANSIENT_MARKERS: &[&str] = &["invalid log", "corrupted", "incomplete", "parsing failed"];

/// How often a running decoder is checked against its timeout.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One failed decoder invocation, classified.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Decoder reported a corruption-shaped failure. Retryable.
    #[error("transient corruption: {detail}")]
    Transient { detail: String },

    /// Decoder exited cleanly but its output did not parse as the expected
    /// report. Treated like corruption: the artifact may be a partial write.
    #[error("unparseable decoder output: {detail}")]
    Unparseable { detail: String },

    /// Decoder binary missing or not spawnable.
    #[error("decoder '{program}' not runnable: {detail}")]
    ToolMissing { program: String, detail: String },

    /// Decoder ran and failed for a non-transient reason.
    #[error("decoder failed (exit {exit_code:?}): {detail}")]
    Failed {
        exit_code: Option<i32>,
        detail: String,
    },

    /// Decoder exceeded its timeout and was killed.
    #[error("decoder timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
}

impl DecodeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecodeError::Transient { .. } | DecodeError::Unparseable { .. }
        )
    }

    fn diagnostic(&self) -> String {
        self.to_string()
    }
}

/// True when decoder diagnostics look like a partial/corrupt read.
pub fn looks_transient(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A tool command plus its hard timeout.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Captured output of a finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ToolOutput {
    /// stderr if non-empty, else stdout; decoders differ in where they
    /// complain.
    pub fn diagnostic_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

fn drain_to_string(mut reader: impl Read + Send + 'static) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run a tool to completion, killing it if the timeout elapses.
///
/// Both output streams are drained on a dedicated thread each so a chatty
/// decoder cannot deadlock on a full pipe, and the child is waited on after
/// a kill so no zombie or handle leaks past this function.
pub fn run_tool(invocation: &ToolInvocation) -> Result<ToolOutput, DecodeError> {
    debug!(
        program = %invocation.program,
        args = ?invocation.args,
        "spawning decoder"
    );

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DecodeError::ToolMissing {
                    program: invocation.program.clone(),
                    detail: err.to_string(),
                }
            } else {
                DecodeError::Failed {
                    exit_code: None,
                    detail: format!("failed to spawn {}: {err}", invocation.program),
                }
            }
        })?;

    let Some(stdout) = child.stdout.take() else {
        return Err(DecodeError::Failed {
            exit_code: None,
            detail: "child stdout was not captured".to_string(),
        });
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(DecodeError::Failed {
            exit_code: None,
            detail: "child stderr was not captured".to_string(),
        });
    };
    let stdout_drain = drain_to_string(stdout);
    let stderr_drain = drain_to_string(stderr);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= invocation.timeout {
                    warn!(
                        program = %invocation.program,
                        timeout = ?invocation.timeout,
                        "decoder exceeded timeout; killing"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_drain.join();
                    let _ = stderr_drain.join();
                    return Err(DecodeError::TimedOut {
                        timeout: invocation.timeout,
                    });
                }
                std::thread::sleep(CHILD_POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_drain.join();
                let _ = stderr_drain.join();
                return Err(DecodeError::Failed {
                    exit_code: None,
                    detail: format!("failed waiting for {}: {err}", invocation.program),
                });
            }
        }
    };

    let stdout = stdout_drain.join().unwrap_or_default();
    let stderr = stderr_drain.join().unwrap_or_default();
    Ok(ToolOutput {
        exit_code: status.code(),
        success: status.success(),
        stdout,
        stderr,
    })
}

/// Map a non-success tool run to a decode failure, checking the diagnostics
/// for corruption markers first.
pub fn failure_from_output(output: &ToolOutput) -> DecodeError {
    let detail = output.diagnostic_text().trim().to_string();
    if looks_transient(&detail) {
        DecodeError::Transient { detail }
    } else {
        DecodeError::Failed {
            exit_code: output.exit_code,
            detail,
        }
    }
}

/// Decodes one build log into a structured issues report.
pub trait BuildLogDecoder {
    fn decode_issues(&self, log_path: &Path) -> Result<IssueReport, DecodeError>;
}

/// Decodes a test-result bundle. Two query shapes: the fast summary used
/// during readiness validation, and the detailed per-test tree.
pub trait ResultBundleDecoder {
    fn summary(&self, bundle_path: &Path) -> Result<BundleSummary, DecodeError>;
    fn test_tree(&self, bundle_path: &Path) -> Result<Vec<TestNode>, DecodeError>;
}

/// Backoff before retry N (1-indexed), roughly Fibonacci.
const BACKOFF_SCHEDULE_SECS: [u64; 6] = [1, 2, 3, 5, 8, 13];

fn backoff_delay(retry_number: u32) -> Duration {
    let index = (retry_number.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
}

/// A successful decode plus how many invocations it took.
#[derive(Debug)]
pub struct Decoded<T> {
    pub report: T,
    pub attempts: u32,
}

/// Run `attempt` until it succeeds, retrying transient failures on the
/// backoff schedule, at most `max_retries` retries after the first attempt.
///
/// Non-transient failures are surfaced immediately: a missing tool will not
/// appear mid-schedule, and an unexpected decoder error is not improved by
/// waiting.
pub fn decode_with_retry<T>(
    max_retries: u32,
    clock: &dyn Clock,
    mut attempt: impl FnMut() -> Result<T, DecodeError>,
) -> Result<Decoded<T>, MonitorError> {
    let total_attempts = max_retries + 1;
    let mut last_detail = String::new();

    for attempt_number in 1..=total_attempts {
        debug!(attempt = attempt_number, total = total_attempts, "decode attempt");
        match attempt() {
            Ok(report) => {
                info!(attempt = attempt_number, "decode succeeded");
                return Ok(Decoded {
                    report,
                    attempts: attempt_number,
                });
            }
            Err(err) if err.is_transient() => {
                last_detail = err.diagnostic();
                if attempt_number < total_attempts {
                    let delay = backoff_delay(attempt_number);
                    warn!(
                        attempt = attempt_number,
                        delay_secs = delay.as_secs(),
                        detail = %last_detail,
                        "transient decode failure; backing off"
                    );
                    clock.sleep(delay);
                }
            }
            Err(DecodeError::ToolMissing { program, detail }) => {
                return Err(MonitorError::DecodeFailed {
                    class: FailureClass::ToolMissing,
                    attempts: attempt_number,
                    diagnostic: format!("{program}: {detail}"),
                });
            }
            Err(DecodeError::TimedOut { timeout }) => {
                return Err(MonitorError::TimedOut {
                    phase: "decoder-invocation".to_string(),
                    waited: timeout,
                });
            }
            Err(err) => {
                return Err(MonitorError::DecodeFailed {
                    class: FailureClass::DecoderError,
                    attempts: attempt_number,
                    diagnostic: err.diagnostic(),
                });
            }
        }
    }

    Err(MonitorError::DecodeFailed {
        class: FailureClass::CorruptionPersisted,
        attempts: total_attempts,
        diagnostic: last_detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::UNIX_EPOCH;

    fn manual_clock() -> ManualClock {
        ManualClock::starting_at(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    #[test]
    fn transient_marker_detection() {
        assert!(looks_transient("error: Invalid log file"));
        assert!(looks_transient("the archive is CORRUPTED"));
        assert!(looks_transient("read failed: incomplete data"));
        assert!(looks_transient("SLF parsing failed at offset 12"));
        assert!(!looks_transient("no such file or directory"));
        assert!(!looks_transient(""));
    }

    #[test]
    fn run_tool_captures_stdout_and_exit() {
        let output = run_tool(&ToolInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo hello".to_string()],
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn run_tool_captures_stderr() {
        let output = run_tool(&ToolInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()],
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.diagnostic_text().trim(), "oops");
    }

    #[test]
    fn run_tool_missing_binary_is_tool_missing() {
        let err = run_tool(&ToolInvocation {
            program: "xcreap-no-such-decoder".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
        })
        .unwrap_err();
        assert!(matches!(err, DecodeError::ToolMissing { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn run_tool_kills_on_timeout() {
        let started = Instant::now();
        let err = run_tool(&ToolInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            timeout: Duration::from_millis(200),
        })
        .unwrap_err();
        assert!(matches!(err, DecodeError::TimedOut { .. }));
        // Must return promptly after the timeout, not after the sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn failure_from_output_classifies_markers() {
        let transient = ToolOutput {
            stdout: String::new(),
            stderr: "error: invalid log: unexpected EOF".to_string(),
            exit_code: Some(1),
            success: false,
        };
        assert!(failure_from_output(&transient).is_transient());

        let hard = ToolOutput {
            stdout: String::new(),
            stderr: "unknown subcommand".to_string(),
            exit_code: Some(64),
            success: false,
        };
        assert!(!failure_from_output(&hard).is_transient());
    }

    #[test]
    fn retry_succeeds_on_third_attempt_with_fibonacci_backoff() {
        let clock = manual_clock();
        let mut calls = 0u32;
        let decoded = decode_with_retry(6, &clock, || {
            calls += 1;
            if calls < 3 {
                Err(DecodeError::Transient {
                    detail: "corrupted".to_string(),
                })
            } else {
                Ok(format!("report-{calls}"))
            }
        })
        .unwrap();

        assert_eq!(decoded.report, "report-3");
        assert_eq!(decoded.attempts, 3);
        assert_eq!(calls, 3);
        // Two backoff delays: 1 s then 2 s.
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn retry_bound_is_max_retries_plus_one() {
        let clock = manual_clock();
        let mut calls = 0u32;
        let err = decode_with_retry::<()>(6, &clock, || {
            calls += 1;
            Err(DecodeError::Transient {
                detail: "incomplete".to_string(),
            })
        })
        .unwrap_err();

        assert_eq!(calls, 7);
        match err {
            MonitorError::DecodeFailed {
                class,
                attempts,
                diagnostic,
            } => {
                assert_eq!(class, FailureClass::CorruptionPersisted);
                assert_eq!(attempts, 7);
                assert!(diagnostic.contains("incomplete"));
            }
            other => panic!("expected DecodeFailed, got: {other:?}"),
        }
        // Full schedule observed, no sleep after the last attempt.
        assert_eq!(
            clock
                .sleeps()
                .iter()
                .map(|d| d.as_secs())
                .collect::<Vec<_>>(),
            vec![1, 2, 3, 5, 8, 13]
        );
    }

    #[test]
    fn tool_missing_fails_immediately_without_retry() {
        let clock = manual_clock();
        let mut calls = 0u32;
        let err = decode_with_retry::<()>(6, &clock, || {
            calls += 1;
            Err(DecodeError::ToolMissing {
                program: "xclogparser".to_string(),
                detail: "No such file or directory".to_string(),
            })
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
        match err {
            MonitorError::DecodeFailed {
                class, attempts, ..
            } => {
                assert_eq!(class, FailureClass::ToolMissing);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected DecodeFailed, got: {other:?}"),
        }
    }

    #[test]
    fn unexpected_decoder_error_fails_immediately() {
        let clock = manual_clock();
        let mut calls = 0u32;
        let err = decode_with_retry::<()>(6, &clock, || {
            calls += 1;
            Err(DecodeError::Failed {
                exit_code: Some(64),
                detail: "unknown subcommand".to_string(),
            })
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(
            err,
            MonitorError::DecodeFailed {
                class: FailureClass::DecoderError,
                ..
            }
        ));
    }

    #[test]
    fn decoder_timeout_maps_to_timed_out() {
        let clock = manual_clock();
        let err = decode_with_retry::<()>(6, &clock, || {
            Err(DecodeError::TimedOut {
                timeout: Duration::from_secs(60),
            })
        })
        .unwrap_err();
        assert!(matches!(err, MonitorError::TimedOut { .. }));
    }

    #[test]
    fn unparseable_output_is_retried() {
        let clock = manual_clock();
        let mut calls = 0u32;
        let decoded = decode_with_retry(6, &clock, || {
            calls += 1;
            if calls == 1 {
                Err(DecodeError::Unparseable {
                    detail: "unexpected end of JSON".to_string(),
                })
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(decoded.attempts, 2);
    }

    #[test]
    fn backoff_schedule_caps_at_last_entry() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(6), Duration::from_secs(13));
        assert_eq!(backoff_delay(99), Duration::from_secs(13));
    }
}
