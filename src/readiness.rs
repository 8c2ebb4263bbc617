//! Result-bundle readiness protocol.
//!
//! An `.xcresult` is written incrementally over the whole test run, and
//! reading it early is worse than slow: a partial bundle can decode into a
//! valid-looking but wrong summary. The decoder is therefore not touched
//! until every available readiness signal agrees the producer has finished.
//!
//! ## State machine
//!
//! ```text
//! Staging         → staging marker gone (or patience exhausted)
//! FilesAppearing  → Info.plist + database.sqlite3 + Data/ all exist
//! SizeStabilizing → member sizes unchanged for a size-scaled window
//! ReadyToRead     → settle delay, then verified read via summary query
//! TimedOut        → overall ceiling hit in any phase before ReadyToRead
//! ```
//!
//! Strictly forward-progressing; the only backward step is the stability
//! counter resetting when a size change is observed mid-window.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ReadinessSettings;
use crate::decode::xcresulttool::BundleSummary;
use crate::decode::ResultBundleDecoder;
use crate::error::{FailureClass, MonitorError};

const MIB: u64 = 1024 * 1024;

/// Byte sizes of the three essential bundle members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSizes {
    pub metadata: u64,
    pub database: u64,
    pub payload: u64,
}

impl MemberSizes {
    pub fn total(&self) -> u64 {
        self.metadata + self.database + self.payload
    }
}

/// One filesystem observation of the bundle.
#[derive(Debug, Clone, Copy)]
pub struct BundleSnapshot {
    pub staging_present: bool,
    /// `Some` only when all three essential members exist.
    pub members: Option<MemberSizes>,
}

/// Phase of the readiness protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// The transient staging marker is still present.
    Staging,
    /// Waiting for the essential members to exist.
    FilesAppearing,
    /// Members exist; waiting for their sizes to hold still.
    SizeStabilizing { stable_samples: u32 },
    /// All filesystem signals agree; the first read may be attempted.
    ReadyToRead { total_bytes: u64 },
    /// The overall ceiling elapsed before ReadyToRead.
    TimedOut { phase: &'static str },
}

impl ReadinessState {
    pub fn phase_label(&self) -> &'static str {
        match self {
            ReadinessState::Staging => "staging",
            ReadinessState::FilesAppearing => "files-appear",
            ReadinessState::SizeStabilizing { .. } => "size-stabilize",
            ReadinessState::ReadyToRead { .. } => "ready-to-read",
            ReadinessState::TimedOut { .. } => "timed-out",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReadinessState::ReadyToRead { .. } | ReadinessState::TimedOut { .. }
        )
    }
}

/// Stability window required for a bundle of this size. Larger bundles take
/// measurably longer to finish flushing; a fixed short window produces false
/// "ready" signals on them.
fn stability_window(total_bytes: u64) -> Duration {
    Duration::from_secs(match total_bytes {
        b if b < 10 * MIB => 2,
        b if b < 50 * MIB => 6,
        b if b < 100 * MIB => 9,
        _ => 12,
    })
}

fn required_stable_samples(total_bytes: u64, poll_interval: Duration) -> u32 {
    let window = stability_window(total_bytes).as_secs();
    let poll = poll_interval.as_secs().max(1);
    (window.div_ceil(poll)).max(1) as u32
}

/// Small safety delay between reaching stability and the first read.
pub fn settle_delay(total_bytes: u64) -> Duration {
    Duration::from_secs(match total_bytes {
        b if b < 10 * MIB => 1,
        b if b < 50 * MIB => 2,
        b if b < 100 * MIB => 3,
        _ => 5,
    })
}

/// Delay between verified-read attempts.
fn validation_delay(total_bytes: u64) -> Duration {
    Duration::from_secs(match total_bytes {
        b if b < 10 * MIB => 3,
        b if b < 50 * MIB => 6,
        b if b < 100 * MIB => 10,
        _ => 15,
    })
}

/// The phase state machine. Pure: fed snapshots and timestamps, never
/// touching the filesystem itself.
#[derive(Debug)]
pub struct ReadinessMachine {
    state: ReadinessState,
    staging_deadline: SystemTime,
    operation_deadline: SystemTime,
    poll_interval: Duration,
    last_total: Option<u64>,
    staging_overrun: bool,
}

impl ReadinessMachine {
    /// `expected_test_duration` scales staging patience: longer suites keep
    /// their staging marker longer. Pass zero when unknown.
    pub fn new(
        settings: &ReadinessSettings,
        expected_test_duration: Duration,
        now: SystemTime,
    ) -> Self {
        let staging_patience = settings.staging_floor().max(expected_test_duration * 2);
        Self {
            state: ReadinessState::Staging,
            staging_deadline: now + staging_patience,
            operation_deadline: now + settings.operation_timeout(),
            poll_interval: settings.poll_interval(),
            last_total: None,
            staging_overrun: false,
        }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    /// Whether the staging marker outlived its patience and was skipped.
    pub fn staging_overrun(&self) -> bool {
        self.staging_overrun
    }

    /// Feed one observation; returns the (possibly advanced) state.
    pub fn observe(&mut self, snapshot: &BundleSnapshot, now: SystemTime) -> &ReadinessState {
        if self.state.is_terminal() {
            return &self.state;
        }
        if now >= self.operation_deadline {
            self.state = ReadinessState::TimedOut {
                phase: self.state.phase_label(),
            };
            return &self.state;
        }

        if self.state == ReadinessState::Staging {
            if !snapshot.staging_present {
                debug!("staging marker cleared");
                self.state = ReadinessState::FilesAppearing;
            } else if now >= self.staging_deadline {
                warn!("staging marker persisted past patience; continuing best-effort");
                self.staging_overrun = true;
                self.state = ReadinessState::FilesAppearing;
            }
        }

        if self.state == ReadinessState::FilesAppearing {
            if let Some(members) = &snapshot.members {
                debug!(total_bytes = members.total(), "essential members present");
                self.last_total = Some(members.total());
                self.state = ReadinessState::SizeStabilizing { stable_samples: 0 };
            }
            // Entering SizeStabilizing only records the baseline; counting
            // starts with the next snapshot.
            return &self.state;
        }

        if let ReadinessState::SizeStabilizing { stable_samples } = self.state.clone() {
            match &snapshot.members {
                None => {
                    // A member vanished mid-write; drop the baseline.
                    self.last_total = None;
                    self.state = ReadinessState::SizeStabilizing { stable_samples: 0 };
                }
                Some(members) => {
                    let total = members.total();
                    if self.last_total == Some(total) {
                        let streak = stable_samples + 1;
                        if streak >= required_stable_samples(total, self.poll_interval) {
                            info!(total_bytes = total, "bundle size stabilized");
                            self.state = ReadinessState::ReadyToRead { total_bytes: total };
                        } else {
                            self.state = ReadinessState::SizeStabilizing {
                                stable_samples: streak,
                            };
                        }
                    } else {
                        debug!(
                            previous = ?self.last_total,
                            current = total,
                            "bundle size changed; stability window restarts"
                        );
                        self.last_total = Some(total);
                        self.state = ReadinessState::SizeStabilizing { stable_samples: 0 };
                    }
                }
            }
        }

        &self.state
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Observe the bundle's current filesystem state.
pub fn snapshot_bundle(bundle: &Path) -> BundleSnapshot {
    let staging_present = bundle.join("Staging").exists();

    let metadata = file_size(&bundle.join("Info.plist"));
    let database = file_size(&bundle.join("database.sqlite3"));
    let payload_dir = bundle.join("Data");
    let payload = payload_dir.is_dir().then(|| dir_size(&payload_dir));

    let members = match (metadata, database, payload) {
        (Some(metadata), Some(database), Some(payload)) => Some(MemberSizes {
            metadata,
            database,
            payload,
        }),
        _ => None,
    };

    BundleSnapshot {
        staging_present,
        members,
    }
}

/// How the readiness wait ended (short of a hard decoder failure).
#[derive(Debug)]
pub enum BundleReadiness {
    /// Filesystem signals and a verified read both agree.
    Ready {
        summary: BundleSummary,
        validation_attempts: u32,
        waited: Duration,
        staging_overrun: bool,
    },
    /// The overall ceiling elapsed. Distinct from corruption: the caller may
    /// simply extend the wait and try again.
    TimedOut { phase: &'static str, waited: Duration },
}

fn elapsed_since(clock: &dyn Clock, started: SystemTime) -> Duration {
    clock
        .now()
        .duration_since(started)
        .unwrap_or(Duration::ZERO)
}

/// Drive the readiness machine against the bundle, then perform the
/// verified read.
///
/// Invalid or empty summary output is "not yet ready" and retried on a
/// size-proportional delay; only a non-transient decoder failure (missing
/// tool, unexpected exit) is an error.
pub fn await_bundle(
    bundle: &Path,
    expected_test_duration: Duration,
    settings: &ReadinessSettings,
    decoder: &dyn ResultBundleDecoder,
    clock: &dyn Clock,
) -> Result<BundleReadiness, MonitorError> {
    let started = clock.now();
    let deadline = started + settings.operation_timeout();
    let mut machine = ReadinessMachine::new(settings, expected_test_duration, started);

    info!(bundle = %bundle.display(), "awaiting result bundle readiness");

    let total_bytes = loop {
        let snapshot = snapshot_bundle(bundle);
        match machine.observe(&snapshot, clock.now()) {
            ReadinessState::ReadyToRead { total_bytes } => break *total_bytes,
            ReadinessState::TimedOut { phase } => {
                let phase = *phase;
                return Ok(BundleReadiness::TimedOut {
                    phase,
                    waited: elapsed_since(clock, started),
                });
            }
            _ => clock.sleep(settings.poll_interval()),
        }
    };

    clock.sleep(settle_delay(total_bytes));

    let mut attempts = 0;
    while attempts < settings.validation_max_attempts {
        attempts += 1;
        match decoder.summary(bundle) {
            Ok(summary) if summary.is_well_formed() => {
                info!(attempts, "bundle passed verified read");
                return Ok(BundleReadiness::Ready {
                    summary,
                    validation_attempts: attempts,
                    waited: elapsed_since(clock, started),
                    staging_overrun: machine.staging_overrun(),
                });
            }
            Ok(_) => {
                debug!(attempts, "summary lacks total count; not ready yet");
            }
            Err(err) if err.is_transient() => {
                debug!(attempts, error = %err, "summary read not clean; not ready yet");
            }
            Err(crate::decode::DecodeError::ToolMissing { program, detail }) => {
                return Err(MonitorError::DecodeFailed {
                    class: FailureClass::ToolMissing,
                    attempts,
                    diagnostic: format!("{program}: {detail}"),
                });
            }
            Err(err) => {
                return Err(MonitorError::DecodeFailed {
                    class: FailureClass::DecoderError,
                    attempts,
                    diagnostic: err.to_string(),
                });
            }
        }

        let delay = validation_delay(total_bytes);
        if clock.now() + delay >= deadline {
            break;
        }
        clock.sleep(delay);
    }

    Ok(BundleReadiness::TimedOut {
        phase: "verified-read",
        waited: elapsed_since(clock, started),
    })
}
