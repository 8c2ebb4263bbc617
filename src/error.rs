//! Failure taxonomy for monitoring operations.
//!
//! Every way a monitoring run can end short of a decoded result is an
//! explicit variant here. Callers need the distinctions: `NotFound` means
//! nothing has been built yet, `NoFreshArtifact` means the trigger produced
//! nothing observable, `TimedOut` means "waiting longer might work", and
//! `DecodeFailed` means the artifact itself (or the decoder install) is the
//! problem.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Classification attached to a failed decode, used to pick remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Decoder binary missing or not runnable.
    ToolMissing,
    /// Transient-corruption retries were exhausted without a clean read.
    CorruptionPersisted,
    /// Decoder ran and failed for a non-transient reason.
    DecoderError,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::ToolMissing => "tool not installed",
            FailureClass::CorruptionPersisted => "corruption persisted",
            FailureClass::DecoderError => "decoder error",
        }
    }
}

/// Terminal outcome of a monitoring operation that produced no result.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// No DerivedData directory matched the project. Nothing has been built
    /// yet — not an environment failure.
    #[error("no DerivedData directory found for {}", project.display())]
    NotFound { project: PathBuf },

    /// The operation was triggered but no artifact newer than the trigger
    /// appeared before the watch timeout. A stale artifact may exist; it is
    /// never returned.
    #[error("triggered, but no fresh artifact observed within {waited:?}")]
    NoFreshArtifact { waited: Duration },

    /// A bounded wait phase expired. Distinct from `DecodeFailed`: the
    /// artifact may simply still be in progress, and waiting longer is a
    /// reasonable caller response.
    #[error("timed out in {phase} phase after {waited:?}")]
    TimedOut { phase: String, waited: Duration },

    /// The decoder could not produce a usable report. `attempts` counts
    /// every decoder invocation made, including retries.
    #[error("decode failed ({}) after {attempts} attempt(s): {diagnostic}", class.label())]
    DecodeFailed {
        class: FailureClass,
        attempts: u32,
        diagnostic: String,
    },
}

impl MonitorError {
    /// Human-facing remediation hint, where one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            MonitorError::DecodeFailed {
                class: FailureClass::ToolMissing,
                ..
            } => Some("install the decoder (e.g. `brew install xclogparser`) and ensure Xcode command line tools are selected (`xcode-select -p`)"),
            MonitorError::DecodeFailed {
                class: FailureClass::CorruptionPersisted,
                ..
            } => Some("the artifact may be truncated; re-run the build/test and monitor again"),
            MonitorError::TimedOut { .. } => {
                Some("the producer may still be running; retry with a longer timeout")
            }
            _ => None,
        }
    }
}
