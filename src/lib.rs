//! Artifact readiness and result extraction for Xcode build/test automation.
//!
//! The hard problem this crate solves: a build or test run triggered in the
//! IDE produces its artifact asynchronously, with no completion signal. The
//! pipeline locates the project's DerivedData, waits for an artifact that is
//! provably newer than the trigger, waits again until the producer has
//! finished writing it, and only then hands it to an external decoder —
//! retrying through the transient corruption that early reads produce.

pub mod buildlog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod decode;
pub mod derived;
pub mod doctor;
pub mod error;
pub mod extract;
pub mod log;
pub mod pipeline;
pub mod readiness;
pub mod stability;
