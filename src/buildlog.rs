//! Build-log freshness watch.
//!
//! A triggered build eventually drops an `.xcactivitylog` into `Logs/Build`,
//! but the directory usually already holds logs from earlier builds — and a
//! rebuild may overwrite an existing filename. Freshness is therefore judged
//! by modification time alone, never by path identity: the watch returns a
//! handle only once the freshest log's mtime is strictly after the trigger.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::BuildLogConfig;
use crate::error::MonitorError;

/// A located artifact and the mtime it was selected by.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// The most-recently-modified entry in `dir` whose name ends with
/// `.extension`. Ties on mtime resolve by path order for determinism.
pub fn freshest_artifact(dir: &Path, extension: &str) -> Option<ArtifactHandle> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<ArtifactHandle> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_match = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if !is_match {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(current) => {
                modified > current.modified
                    || (modified == current.modified && path < current.path)
            }
        };
        if better {
            best = Some(ArtifactHandle { path, modified });
        }
    }
    best
}

/// Poll `dir` until an artifact with `modified > triggered_at` appears.
///
/// On timeout the outcome is `NoFreshArtifact` — a stale artifact is never
/// substituted, even if one is sitting right there.
pub fn watch_fresh_artifact(
    dir: &Path,
    extension: &str,
    triggered_at: SystemTime,
    config: &BuildLogConfig,
    clock: &dyn Clock,
) -> Result<ArtifactHandle, MonitorError> {
    let started = clock.now();
    let deadline = started + config.watch_timeout();

    loop {
        if let Some(handle) = freshest_artifact(dir, extension) {
            if handle.modified > triggered_at {
                info!(
                    path = %handle.path.display(),
                    "fresh artifact observed"
                );
                return Ok(handle);
            }
            debug!(
                path = %handle.path.display(),
                "freshest artifact predates trigger; waiting"
            );
        }

        let now = clock.now();
        if now >= deadline {
            let waited = now
                .duration_since(started)
                .unwrap_or_else(|_| config.watch_timeout());
            return Err(MonitorError::NoFreshArtifact { waited });
        }
        clock.sleep(config.poll_interval());
    }
}

/// Watch `Logs/Build` for a build log newer than the trigger.
pub fn watch_build_log(
    build_logs_dir: &Path,
    triggered_at: SystemTime,
    config: &BuildLogConfig,
    clock: &dyn Clock,
) -> Result<ArtifactHandle, MonitorError> {
    watch_fresh_artifact(build_logs_dir, "xcactivitylog", triggered_at, config, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use filetime::FileTime;
    use proptest::prelude::*;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};

    fn set_mtime(path: &Path, at: SystemTime) {
        filetime::set_file_mtime(path, FileTime::from_system_time(at)).unwrap();
    }

    fn write_log(dir: &Path, name: &str, at: SystemTime) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"slf0").unwrap();
        set_mtime(&path, at);
        path
    }

    fn base_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn freshest_picks_latest_mtime_regardless_of_name() {
        let tmp = tempfile::tempdir().unwrap();
        let t = base_time();
        write_log(tmp.path(), "zzz.xcactivitylog", t);
        let newest = write_log(tmp.path(), "aaa.xcactivitylog", t + Duration::from_secs(5));

        let handle = freshest_artifact(tmp.path(), "xcactivitylog").unwrap();
        assert_eq!(handle.path, newest);
    }

    #[test]
    fn freshest_ignores_other_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let t = base_time();
        write_log(tmp.path(), "notes.txt", t + Duration::from_secs(100));
        let log = write_log(tmp.path(), "build.xcactivitylog", t);

        let handle = freshest_artifact(tmp.path(), "xcactivitylog").unwrap();
        assert_eq!(handle.path, log);
    }

    #[test]
    fn freshest_empty_dir_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(freshest_artifact(tmp.path(), "xcactivitylog").is_none());
    }

    #[test]
    fn fresh_log_already_present_returns_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let trigger = base_time();
        let log = write_log(tmp.path(), "b.xcactivitylog", trigger + Duration::from_secs(1));

        let clock = ManualClock::starting_at(trigger);
        let handle =
            watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock).unwrap();
        assert_eq!(handle.path, log);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn stale_log_is_never_returned() {
        let tmp = tempfile::tempdir().unwrap();
        let trigger = base_time();
        // Only a log from before the trigger exists, and nothing new arrives.
        write_log(tmp.path(), "old.xcactivitylog", trigger - Duration::from_secs(60));

        let clock = ManualClock::starting_at(trigger);
        let result = watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock);
        match result {
            Err(MonitorError::NoFreshArtifact { waited }) => {
                assert!(waited >= Duration::from_secs(30));
            }
            other => panic!("expected NoFreshArtifact, got: {other:?}"),
        }
    }

    #[test]
    fn log_appearing_mid_watch_is_picked_up() {
        let tmp = tempfile::tempdir().unwrap();
        let trigger = base_time();
        write_log(tmp.path(), "old.xcactivitylog", trigger - Duration::from_secs(60));

        let clock = ManualClock::starting_at(trigger);
        let dir = tmp.path().to_path_buf();
        let fresh_at = trigger + Duration::from_secs(2);
        clock.schedule(fresh_at, move || {
            let path = dir.join("new.xcactivitylog");
            fs::write(&path, b"slf0").unwrap();
            filetime::set_file_mtime(&path, FileTime::from_system_time(fresh_at)).unwrap();
        });

        let handle =
            watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock).unwrap();
        assert!(handle.path.ends_with("new.xcactivitylog"));
        assert!(handle.modified > trigger);
    }

    #[test]
    fn overwritten_same_filename_counts_as_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let trigger = base_time();
        let log = write_log(tmp.path(), "only.xcactivitylog", trigger - Duration::from_secs(60));

        let clock = ManualClock::starting_at(trigger);
        let path = log.clone();
        let rewrite_at = trigger + Duration::from_secs(3);
        clock.schedule(rewrite_at, move || {
            filetime::set_file_mtime(&path, FileTime::from_system_time(rewrite_at)).unwrap();
        });

        let handle =
            watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock).unwrap();
        assert_eq!(handle.path, log);
        assert!(handle.modified > trigger);
    }

    #[test]
    fn mtime_equal_to_trigger_is_not_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let trigger = base_time();
        write_log(tmp.path(), "b.xcactivitylog", trigger);

        let clock = ManualClock::starting_at(trigger);
        let result = watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock);
        assert!(matches!(result, Err(MonitorError::NoFreshArtifact { .. })));
    }

    proptest! {
        // Freshness invariant: whatever mix of log mtimes exists around the
        // trigger, a returned handle postdates the trigger; if none does, the
        // watch reports NoFreshArtifact.
        #[test]
        fn freshness_invariant(offsets in proptest::collection::vec(-300i64..300, 1..8)) {
            let tmp = tempfile::tempdir().unwrap();
            let trigger = base_time();
            let mut any_fresh = false;
            for (i, offset) in offsets.iter().enumerate() {
                let at = if *offset >= 0 {
                    trigger + Duration::from_secs(*offset as u64)
                } else {
                    trigger - Duration::from_secs((-offset) as u64)
                };
                if *offset > 0 {
                    any_fresh = true;
                }
                write_log(tmp.path(), &format!("log-{i}.xcactivitylog"), at);
            }

            let clock = ManualClock::starting_at(trigger);
            let result = watch_build_log(tmp.path(), trigger, &BuildLogConfig::default(), &clock);
            match result {
                Ok(handle) => {
                    prop_assert!(any_fresh);
                    prop_assert!(handle.modified > trigger);
                }
                Err(MonitorError::NoFreshArtifact { .. }) => prop_assert!(!any_fresh),
                Err(other) => prop_assert!(false, "unexpected outcome: {other:?}"),
            }
        }
    }
}
