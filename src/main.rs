use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use xcreap::cli::{Cli, Command};
use xcreap::clock::SystemClock;
use xcreap::config::ReapConfig;
use xcreap::decode::xclogparser::XclogparserDecoder;
use xcreap::decode::xcresulttool::XcresulttoolDecoder;
use xcreap::derived::locate_derived_data;
use xcreap::doctor::{format_doctor_report, run_doctor};
use xcreap::error::MonitorError;
use xcreap::extract::{format_build_result, format_test_summary};
use xcreap::log::EventSink;
use xcreap::pipeline::Pipeline;

fn trigger_time(triggered_at: Option<u64>) -> SystemTime {
    match triggered_at {
        Some(secs) => UNIX_EPOCH + Duration::from_secs(secs),
        None => SystemTime::now(),
    }
}

fn event_sink(config: &ReapConfig) -> Result<EventSink> {
    match &config.event_log {
        Some(path) => EventSink::to_file(path),
        None => Ok(EventSink::disabled()),
    }
}

/// Keep the failure classification visible to the user, plus the remediation
/// hint when one applies.
fn report_monitor_error(err: MonitorError) -> anyhow::Error {
    match err.remediation() {
        Some(hint) => anyhow::anyhow!("{err}\nhint: {hint}"),
        None => anyhow::anyhow!("{err}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "xcreap=info",
        1 => "xcreap=debug",
        _ => "xcreap=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let (config, config_path) = ReapConfig::load(&cwd)?;
    match config_path {
        Some(ref path) => info!("loaded config from {}", path.display()),
        None => info!("no .xcreap/config.toml found, using defaults"),
    }

    let clock = SystemClock;

    match cli.command {
        Command::BuildLog {
            project,
            triggered_at,
            json,
        } => {
            let events = event_sink(&config)?;
            let pipeline = Pipeline::new(&config, &clock, &events);
            let decoder = XclogparserDecoder::from_config(&config.decoder);
            let report = pipeline
                .monitor_build(&project, trigger_time(triggered_at), &decoder)
                .map_err(report_monitor_error)?;

            if report.possibly_incomplete {
                eprintln!("warning: log never stabilized; results may be incomplete");
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report.result)?);
            } else {
                print!("{}", format_build_result(&report.result));
            }
        }

        Command::TestResults {
            project,
            bundle,
            triggered_at,
            expected_duration_secs,
            json,
        } => {
            let events = event_sink(&config)?;
            let pipeline = Pipeline::new(&config, &clock, &events);
            let decoder = XcresulttoolDecoder::from_config(&config.decoder);
            let expected = Duration::from_secs(expected_duration_secs);

            let report = match (&bundle, &project) {
                (Some(bundle), _) => pipeline
                    .read_bundle(bundle, expected, &decoder)
                    .map_err(report_monitor_error)?,
                (None, Some(project)) => pipeline
                    .monitor_tests(project, trigger_time(triggered_at), expected, &decoder)
                    .map_err(report_monitor_error)?,
                (None, None) => {
                    anyhow::bail!("pass a project path or --bundle <path.xcresult>")
                }
            };

            if report.staging_overrun {
                eprintln!("warning: staging marker never cleared; results may be incomplete");
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report.summary)?);
            } else {
                print!("{}", format_test_summary(&report.summary));
            }
        }

        Command::Locate { project } => {
            let root = config.locator.root()?;
            match locate_derived_data(&project, root)? {
                Some(location) => println!("{}", location.derived_data_dir.display()),
                None => {
                    println!("not found (no build has produced DerivedData for this project yet)");
                }
            }
        }

        Command::Doctor => {
            let report = run_doctor(&config);
            print!("{}", format_doctor_report(&report));
            if !report.all_passed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
