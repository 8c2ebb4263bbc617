//! End-to-end monitoring operations.
//!
//! One invocation is one sequential, bounded flow: locate → freshness →
//! stability/readiness → decode → extract. Phases run strictly in that
//! order; a timeout degrades to a best-effort continue or a distinct
//! `TimedOut` outcome, never to a skipped check.
//!
//! Nothing here serializes concurrent invocations. Two operations racing on
//! the same DerivedData directory (a clean chased by a build, say) can read
//! each other's artifacts; callers that interleave operations against one
//! project must serialize them.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::buildlog::{ArtifactHandle, watch_build_log, watch_fresh_artifact};
use crate::clock::Clock;
use crate::config::ReapConfig;
use crate::decode::{BuildLogDecoder, ResultBundleDecoder, decode_with_retry};
use crate::derived::{ProjectArtifactLocation, locate_derived_data};
use crate::error::MonitorError;
use crate::extract::{
    DecodedBuildResult, TestResultSummary, failures_from_tree, normalize_issues, summarize_bundle,
};
use crate::log::{EventSink, MonitorEvent};
use crate::readiness::{BundleReadiness, await_bundle};
use crate::stability::{StabilityOutcome, wait_for_stable};

/// Result of a build-monitoring operation.
#[derive(Debug)]
pub struct BuildMonitorReport {
    /// The log that was decoded; `modified` postdates the trigger.
    pub log: ArtifactHandle,
    pub result: DecodedBuildResult,
    pub decode_attempts: u32,
    /// Set when the log never stabilized and was decoded best-effort.
    pub possibly_incomplete: bool,
}

/// Result of a test-monitoring operation.
#[derive(Debug)]
pub struct TestMonitorReport {
    pub bundle: PathBuf,
    pub summary: TestResultSummary,
    pub validation_attempts: u32,
    /// Set when the staging marker outlived its patience.
    pub staging_overrun: bool,
}

/// The monitoring pipeline: configuration, time source, and event sink for
/// one or more sequential operations.
pub struct Pipeline<'a> {
    config: &'a ReapConfig,
    clock: &'a dyn Clock,
    events: &'a EventSink,
}

fn epoch_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a ReapConfig, clock: &'a dyn Clock, events: &'a EventSink) -> Self {
        Self {
            config,
            clock,
            events,
        }
    }

    /// Resolve the project's DerivedData directory.
    ///
    /// Unexpected filesystem errors are mapped to `NotFound`: environment
    /// noise must not surface as a crash, and "cannot list DerivedData"
    /// means the same thing to the caller as "nothing built yet".
    fn locate(&self, project: &Path) -> Result<ProjectArtifactLocation, MonitorError> {
        let root = match self.config.locator.root() {
            Ok(root) => root,
            Err(err) => {
                warn!(error = %err, "DerivedData root unresolvable");
                return Err(MonitorError::NotFound {
                    project: project.to_path_buf(),
                });
            }
        };
        match locate_derived_data(project, root) {
            Ok(Some(location)) => {
                self.events.emit(MonitorEvent::DerivedDataLocated {
                    path: location.derived_data_dir.display().to_string(),
                });
                Ok(location)
            }
            Ok(None) => Err(MonitorError::NotFound {
                project: project.to_path_buf(),
            }),
            Err(err) => {
                debug!(error = %err, "locator failed; reporting not-found");
                Err(MonitorError::NotFound {
                    project: project.to_path_buf(),
                })
            }
        }
    }

    /// Monitor a triggered build: wait for a fresh log, let it stabilize,
    /// decode it (retrying transient corruption), and normalize the issues.
    pub fn monitor_build(
        &self,
        project: &Path,
        triggered_at: SystemTime,
        decoder: &dyn BuildLogDecoder,
    ) -> Result<BuildMonitorReport, MonitorError> {
        info!(project = %project.display(), "monitoring build");
        self.events.emit(MonitorEvent::OperationStarted {
            kind: "build".to_string(),
            project: project.display().to_string(),
            triggered_at_epoch_secs: epoch_secs(triggered_at),
        });

        let location = self.locate(project)?;
        let fresh = watch_build_log(
            &location.build_logs_dir(),
            triggered_at,
            &self.config.build_log,
            self.clock,
        )?;
        self.events.emit(MonitorEvent::FreshArtifactObserved {
            path: fresh.path.display().to_string(),
        });

        self.events.emit(MonitorEvent::PhaseEntered {
            phase: "stabilize".to_string(),
        });
        let (log, possibly_incomplete) =
            match wait_for_stable(&fresh.path, &self.config.stability, self.clock) {
                StabilityOutcome::Stable(handle) => (handle, false),
                StabilityOutcome::StillChanging(handle) => {
                    self.events.emit(MonitorEvent::StabilityTimeout {
                        waited_secs: self.config.stability.timeout_secs,
                    });
                    (handle, true)
                }
            };

        self.events.emit(MonitorEvent::PhaseEntered {
            phase: "decode".to_string(),
        });
        let decoded = decode_with_retry(self.config.decoder.max_retries, self.clock, || {
            decoder.decode_issues(&log.path)
        })
        .inspect_err(|err| {
            self.events.emit(MonitorEvent::OperationFailed {
                classification: err.to_string(),
            });
        })?;

        self.events.emit(MonitorEvent::DecodeAttempt {
            attempt: decoded.attempts,
            outcome: "decoded".to_string(),
        });

        let result = normalize_issues(&decoded.report);
        self.events.emit(MonitorEvent::OperationCompleted {
            outcome: format!(
                "{} error(s), {} warning(s)",
                result.errors.len(),
                result.warnings.len()
            ),
        });

        Ok(BuildMonitorReport {
            log,
            result,
            decode_attempts: decoded.attempts,
            possibly_incomplete,
        })
    }

    /// Monitor a triggered test run: wait for a fresh result bundle, run the
    /// readiness protocol, then extract the summary (and, if the summary
    /// lacks failure detail, the detailed tree).
    pub fn monitor_tests(
        &self,
        project: &Path,
        triggered_at: SystemTime,
        expected_test_duration: Duration,
        decoder: &dyn ResultBundleDecoder,
    ) -> Result<TestMonitorReport, MonitorError> {
        info!(project = %project.display(), "monitoring test run");
        self.events.emit(MonitorEvent::OperationStarted {
            kind: "test".to_string(),
            project: project.display().to_string(),
            triggered_at_epoch_secs: epoch_secs(triggered_at),
        });

        let location = self.locate(project)?;
        let fresh = watch_fresh_artifact(
            &location.test_logs_dir(),
            "xcresult",
            triggered_at,
            &self.config.build_log,
            self.clock,
        )?;
        self.events.emit(MonitorEvent::FreshArtifactObserved {
            path: fresh.path.display().to_string(),
        });

        self.read_bundle(&fresh.path, expected_test_duration, decoder)
    }

    /// Run the readiness protocol and extraction against an explicit bundle
    /// path (no locate/freshness phases — the caller already knows which
    /// bundle the operation produced).
    pub fn read_bundle(
        &self,
        bundle: &Path,
        expected_test_duration: Duration,
        decoder: &dyn ResultBundleDecoder,
    ) -> Result<TestMonitorReport, MonitorError> {
        self.events.emit(MonitorEvent::PhaseEntered {
            phase: "readiness".to_string(),
        });

        let readiness = await_bundle(
            bundle,
            expected_test_duration,
            &self.config.readiness,
            decoder,
            self.clock,
        )
        .inspect_err(|err| {
            self.events.emit(MonitorEvent::OperationFailed {
                classification: err.to_string(),
            });
        })?;

        let (bundle_summary, validation_attempts, staging_overrun) = match readiness {
            BundleReadiness::Ready {
                summary,
                validation_attempts,
                waited,
                staging_overrun,
            } => {
                debug!(?waited, validation_attempts, "bundle ready");
                if staging_overrun {
                    self.events.emit(MonitorEvent::StagingOverrun {
                        waited_secs: self.config.readiness.staging_floor_secs,
                    });
                }
                self.events.emit(MonitorEvent::ValidationAttempt {
                    attempt: validation_attempts,
                    ready: true,
                });
                (summary, validation_attempts, staging_overrun)
            }
            BundleReadiness::TimedOut { phase, waited } => {
                self.events.emit(MonitorEvent::OperationFailed {
                    classification: format!("timed out in {phase}"),
                });
                return Err(MonitorError::TimedOut {
                    phase: phase.to_string(),
                    waited,
                });
            }
        };

        let mut summary = summarize_bundle(&bundle_summary);
        if summary.failed > 0 && summary.failures.is_empty() {
            // The summary query sometimes omits failure entries; the
            // detailed tree still has them. Best-effort only.
            match decoder.test_tree(bundle) {
                Ok(tree) => summary.failures = failures_from_tree(&tree),
                Err(err) => {
                    debug!(error = %err, "detailed query failed; keeping bare counts")
                }
            }
        }

        self.events.emit(MonitorEvent::OperationCompleted {
            outcome: format!(
                "{} total, {} passed, {} failed, {} skipped",
                summary.total, summary.passed, summary.failed, summary.skipped
            ),
        });

        Ok(TestMonitorReport {
            bundle: bundle.to_path_buf(),
            summary,
            validation_attempts,
            staging_overrun,
        })
    }
}
