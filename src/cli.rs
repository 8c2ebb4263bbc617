use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "xcreap",
    about = "Wait for Xcode build/test artifacts and extract structured results",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for a triggered build's log and decode it into errors/warnings
    BuildLog {
        /// Absolute path to the .xcodeproj/.xcworkspace (or its directory)
        project: PathBuf,

        /// Trigger time as Unix seconds; defaults to now (wait for the next
        /// build to finish)
        #[arg(long)]
        triggered_at: Option<u64>,

        /// Print the result as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },

    /// Wait for a triggered test run's result bundle and summarize it
    TestResults {
        /// Absolute path to the .xcodeproj/.xcworkspace (or its directory)
        project: Option<PathBuf>,

        /// Read this .xcresult directly instead of locating one
        #[arg(long, conflicts_with = "project")]
        bundle: Option<PathBuf>,

        /// Trigger time as Unix seconds; defaults to now
        #[arg(long)]
        triggered_at: Option<u64>,

        /// Expected test duration in seconds (scales staging patience)
        #[arg(long, default_value = "0")]
        expected_duration_secs: u64,

        /// Print the result as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },

    /// Resolve a project's DerivedData directory
    Locate {
        /// Absolute path to the .xcodeproj/.xcworkspace (or its directory)
        project: PathBuf,
    },

    /// Check that the decoders and DerivedData root are usable
    Doctor,
}
