//! Write-completion detection for a located artifact.
//!
//! A fresh build log may still be mid-write when it first appears. The
//! producing process gives no completion signal, so the only usable signal
//! is the file going quiet: N consecutive polls with an unchanged mtime.
//! The tracker is a pure state machine; `wait_for_stable` drives it against
//! the filesystem.

use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::buildlog::ArtifactHandle;
use crate::clock::Clock;
use crate::config::StabilityConfig;

/// Counts consecutive unchanged-mtime observations.
#[derive(Debug)]
pub struct StabilityTracker {
    required: u32,
    last: Option<SystemTime>,
    streak: u32,
}

impl StabilityTracker {
    pub fn new(required_consecutive: u32) -> Self {
        Self {
            required: required_consecutive.max(1),
            last: None,
            streak: 0,
        }
    }

    /// Feed one observation. Returns true once the artifact has held still
    /// for the required number of consecutive observations. The first
    /// observation only establishes the baseline.
    pub fn observe(&mut self, modified: SystemTime) -> bool {
        match self.last {
            Some(last) if last == modified => self.streak += 1,
            _ => {
                self.last = Some(modified);
                self.streak = 0;
            }
        }
        self.streak >= self.required
    }

    /// Drop the baseline, e.g. after the file briefly went missing.
    pub fn reset(&mut self) {
        self.last = None;
        self.streak = 0;
    }
}

/// How the stability wait ended.
#[derive(Debug)]
pub enum StabilityOutcome {
    /// The artifact held still for the required window.
    Stable(ArtifactHandle),
    /// The overall timeout elapsed first. The latest handle is returned so
    /// the caller can decode best-effort; the result should be tagged as
    /// possibly incomplete.
    StillChanging(ArtifactHandle),
}

/// Poll `path` until its mtime holds still, or the timeout elapses.
pub fn wait_for_stable(
    path: &Path,
    config: &StabilityConfig,
    clock: &dyn Clock,
) -> StabilityOutcome {
    let started = clock.now();
    let deadline = started + config.timeout();
    let mut tracker = StabilityTracker::new(config.required_stable_polls);
    let mut latest = ArtifactHandle {
        path: path.to_path_buf(),
        modified: started,
    };

    loop {
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => {
                latest.modified = modified;
                if tracker.observe(modified) {
                    debug!(path = %path.display(), "artifact stabilized");
                    return StabilityOutcome::Stable(latest);
                }
            }
            Err(err) => {
                // Transient fs noise (or the producer replacing the file);
                // start the window over rather than aborting.
                debug!(path = %path.display(), error = %err, "stat failed during stability poll");
                tracker.reset();
            }
        }

        if clock.now() >= deadline {
            warn!(
                path = %path.display(),
                timeout_secs = config.timeout_secs,
                "artifact never stabilized; continuing best-effort"
            );
            return StabilityOutcome::StillChanging(latest);
        }
        clock.sleep(config.poll_interval());
    }
}
