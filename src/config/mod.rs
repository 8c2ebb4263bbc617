use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".xcreap";

fn default_derived_data_root() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Library/Developer/Xcode/DerivedData"))
}

fn default_log_poll_millis() -> u64 {
    500
}

fn default_log_watch_timeout_secs() -> u64 {
    30
}

fn default_stability_poll_millis() -> u64 {
    500
}

fn default_required_stable_polls() -> u32 {
    6
}

fn default_stability_timeout_secs() -> u64 {
    300
}

fn default_xclogparser_program() -> String {
    "xclogparser".to_string()
}

fn default_xcresulttool_program() -> String {
    "xcrun".to_string()
}

fn default_decode_timeout_secs() -> u64 {
    60
}

fn default_summary_timeout_secs() -> u64 {
    20
}

fn default_max_decode_retries() -> u32 {
    6
}

fn default_bundle_poll_secs() -> u64 {
    3
}

fn default_staging_floor_secs() -> u64 {
    300
}

fn default_operation_timeout_secs() -> u64 {
    1200
}

fn default_validation_max_attempts() -> u32 {
    12
}

/// Where DerivedData lives.
#[derive(Debug, Deserialize)]
pub struct LocatorConfig {
    /// DerivedData root. Defaults to the standard per-user location.
    #[serde(default = "default_derived_data_root")]
    pub derived_data_root: Option<PathBuf>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            derived_data_root: default_derived_data_root(),
        }
    }
}

impl LocatorConfig {
    pub fn root(&self) -> Result<&Path> {
        self.derived_data_root.as_deref().context(
            "DerivedData root not configured and home directory unknown; \
             set locator.derived_data_root in .xcreap/config.toml",
        )
    }
}

/// Build-log freshness watch.
#[derive(Debug, Deserialize)]
pub struct BuildLogConfig {
    #[serde(default = "default_log_poll_millis")]
    pub poll_millis: u64,
    #[serde(default = "default_log_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
}

impl Default for BuildLogConfig {
    fn default() -> Self {
        Self {
            poll_millis: default_log_poll_millis(),
            watch_timeout_secs: default_log_watch_timeout_secs(),
        }
    }
}

impl BuildLogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

/// Write-completion detection for a located artifact.
#[derive(Debug, Deserialize)]
pub struct StabilityConfig {
    #[serde(default = "default_stability_poll_millis")]
    pub poll_millis: u64,
    /// Consecutive unchanged-mtime polls required before the artifact is
    /// considered fully written.
    #[serde(default = "default_required_stable_polls")]
    pub required_stable_polls: u32,
    #[serde(default = "default_stability_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_millis: default_stability_poll_millis(),
            required_stable_polls: default_required_stable_polls(),
            timeout_secs: default_stability_timeout_secs(),
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// External decoder programs and their invocation limits.
#[derive(Debug, Deserialize)]
pub struct DecoderConfig {
    /// Build-log decoder binary (xclogparser).
    #[serde(default = "default_xclogparser_program")]
    pub xclogparser: String,
    /// Result-bundle decoder binary; `xcresulttool` is reached through this
    /// (normally `xcrun`).
    #[serde(default = "default_xcresulttool_program")]
    pub xcresulttool: String,
    /// Hard timeout for one full decode invocation.
    #[serde(default = "default_decode_timeout_secs")]
    pub decode_timeout_secs: u64,
    /// Shorter timeout for the fast summary query used during readiness
    /// validation.
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,
    /// Retries after the first attempt when the decoder reports transient
    /// corruption.
    #[serde(default = "default_max_decode_retries")]
    pub max_retries: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            xclogparser: default_xclogparser_program(),
            xcresulttool: default_xcresulttool_program(),
            decode_timeout_secs: default_decode_timeout_secs(),
            summary_timeout_secs: default_summary_timeout_secs(),
            max_retries: default_max_decode_retries(),
        }
    }
}

impl DecoderConfig {
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }
}

/// Result-bundle readiness protocol.
#[derive(Debug, Deserialize)]
pub struct ReadinessSettings {
    /// Interval between bundle snapshots.
    #[serde(default = "default_bundle_poll_secs")]
    pub poll_secs: u64,
    /// Minimum patience for the staging marker, regardless of expected test
    /// duration.
    #[serde(default = "default_staging_floor_secs")]
    pub staging_floor_secs: u64,
    /// Ceiling for the whole monitoring operation.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Bounded attempts for the verified-read step.
    #[serde(default = "default_validation_max_attempts")]
    pub validation_max_attempts: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_secs: default_bundle_poll_secs(),
            staging_floor_secs: default_staging_floor_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            validation_max_attempts: default_validation_max_attempts(),
        }
    }
}

impl ReadinessSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn staging_floor(&self) -> Duration {
        Duration::from_secs(self.staging_floor_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ReapConfig {
    #[serde(default)]
    pub locator: LocatorConfig,
    #[serde(default)]
    pub build_log: BuildLogConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    /// Optional JSONL event log path for monitor runs.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl ReapConfig {
    /// Search upward from `start` for a `.xcreap/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ReapConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ReapConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ReapConfig::default();
        assert_eq!(config.build_log.poll_millis, 500);
        assert_eq!(config.build_log.watch_timeout_secs, 30);
        assert_eq!(config.stability.required_stable_polls, 6);
        assert_eq!(config.stability.timeout_secs, 300);
        assert_eq!(config.decoder.xclogparser, "xclogparser");
        assert_eq!(config.decoder.xcresulttool, "xcrun");
        assert_eq!(config.decoder.max_retries, 6);
        assert_eq!(config.readiness.poll_secs, 3);
        assert_eq!(config.readiness.staging_floor_secs, 300);
        assert_eq!(config.readiness.validation_max_attempts, 12);
        assert!(config.event_log.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
event_log = "/tmp/xcreap-events.jsonl"

[locator]
derived_data_root = "/builds/DerivedData"

[build_log]
poll_millis = 250
watch_timeout_secs = 60

[stability]
poll_millis = 1000
required_stable_polls = 4
timeout_secs = 120

[decoder]
xclogparser = "/opt/bin/xclogparser"
decode_timeout_secs = 90
max_retries = 3

[readiness]
poll_secs = 5
staging_floor_secs = 600
operation_timeout_secs = 2400
validation_max_attempts = 8
"#;
        let config: ReapConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.locator.derived_data_root.as_deref(),
            Some(Path::new("/builds/DerivedData"))
        );
        assert_eq!(config.build_log.poll_millis, 250);
        assert_eq!(config.build_log.watch_timeout_secs, 60);
        assert_eq!(config.stability.required_stable_polls, 4);
        assert_eq!(config.decoder.xclogparser, "/opt/bin/xclogparser");
        assert_eq!(config.decoder.decode_timeout_secs, 90);
        assert_eq!(config.decoder.max_retries, 3);
        assert_eq!(config.readiness.poll_secs, 5);
        assert_eq!(config.readiness.operation_timeout_secs, 2400);
        assert_eq!(
            config.event_log.as_deref(),
            Some(Path::new("/tmp/xcreap-events.jsonl"))
        );
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[decoder]
max_retries = 1
"#;
        let config: ReapConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.decoder.max_retries, 1);
        assert_eq!(config.decoder.xclogparser, "xclogparser");
        assert_eq!(config.build_log.poll_millis, 500);
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".xcreap");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[build_log]
watch_timeout_secs = 45
"#,
        )
        .unwrap();

        let (config, path) = ReapConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.build_log.watch_timeout_secs, 45);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ReapConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.build_log.watch_timeout_secs, 30);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".xcreap");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[stability]
timeout_secs = 90
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ReapConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.stability.timeout_secs, 90);
    }

    #[test]
    fn duration_helpers() {
        let config = ReapConfig::default();
        assert_eq!(config.build_log.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.stability.timeout(), Duration::from_secs(300));
        assert_eq!(config.readiness.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.decoder.summary_timeout(), Duration::from_secs(20));
    }
}
