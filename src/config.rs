//! Boot configuration.
//!
//! Everything has a built-in default so the shim boots with no file at all.
//! An optional TOML file overrides individual fields; the path defaults to
//! `/cf_init.toml` and can be moved with `CF_INIT_CONFIG`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handoff::HandoffCandidate;
use crate::mount::{DeviceNode, MountFlag, MountSpec};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/cf_init.toml";

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "CF_INIT_CONFIG";

/// What the shim does once the environment is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    /// Chain-load the real init immediately
    Handoff,
    /// Keep control and emit heartbeats until signalled
    Heartbeat,
}

impl Default for BootMode {
    fn default() -> Self {
        BootMode::Handoff
    }
}

/// Top-level boot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// Post-bootstrap behaviour
    #[serde(default)]
    pub mode: BootMode,
    /// Pseudo-filesystems to mount, in mount order
    #[serde(default = "default_mounts")]
    pub mounts: Vec<MountSpec>,
    /// Fallback device nodes created when devtmpfs has not provided them
    #[serde(default = "default_device_nodes")]
    pub device_nodes: Vec<DeviceNode>,
    /// Console acquisition
    #[serde(default)]
    pub console: ConsoleConfig,
    /// Log devices
    #[serde(default)]
    pub journal: JournalConfig,
    /// Heartbeat loop
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Handoff to the real init
    #[serde(default)]
    pub handoff: HandoffConfig,
    /// Marker files receiving boot-stage breadcrumbs
    #[serde(default = "default_markers")]
    pub markers: Vec<PathBuf>,
    /// Log presence of essential device nodes after console binding
    #[serde(default = "default_true")]
    pub sanity_checks: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            mode: BootMode::default(),
            mounts: default_mounts(),
            device_nodes: default_device_nodes(),
            console: ConsoleConfig::default(),
            journal: JournalConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            handoff: HandoffConfig::default(),
            markers: default_markers(),
            sanity_checks: true,
        }
    }
}

impl BootConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BootConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration file path from the environment.
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the configuration file if present.
    ///
    /// `Ok(None)` means no file exists and defaults apply.
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path();
        if !path.exists() {
            return Ok(None);
        }
        Self::from_file(&path).map(Some)
    }

    fn validate(&self) -> Result<()> {
        if self.handoff.candidates.is_empty() {
            return Err(Error::ConfigError(
                "at least one handoff candidate is required".to_string(),
            ));
        }
        if self.console.attempts == 0 {
            return Err(Error::ConfigError(
                "console.attempts must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(Error::ConfigError(
                "heartbeat.interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Console acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Primary console device
    #[serde(default = "default_console_path")]
    pub path: PathBuf,
    /// Open attempts on the primary console
    #[serde(default = "default_console_attempts")]
    pub attempts: u32,
    /// Delay between attempts
    #[serde(default = "default_console_retry_delay", rename = "retry_delay_ms")]
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Serial consoles tried once each when the primary never appears
    #[serde(default = "default_console_fallbacks")]
    pub fallbacks: Vec<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            path: default_console_path(),
            attempts: default_console_attempts(),
            retry_delay: default_console_retry_delay(),
            fallbacks: default_console_fallbacks(),
        }
    }
}

/// Log device paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_kmsg_path")]
    pub kmsg: PathBuf,
    #[serde(default = "default_console_path")]
    pub console: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            kmsg: default_kmsg_path(),
            console: default_console_path(),
        }
    }
}

/// Heartbeat loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between heartbeats
    #[serde(default = "default_heartbeat_interval", rename = "interval_secs")]
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Hand off to the real init after this many beats
    #[serde(default)]
    pub handoff_after: Option<u32>,
    /// Delay after unmounting before exit
    #[serde(default = "default_grace", rename = "grace_ms")]
    #[serde(with = "duration_ms")]
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            handoff_after: None,
            grace: default_grace(),
        }
    }
}

/// Handoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Where the real init is expected
    #[serde(default = "default_init_target")]
    pub target: PathBuf,
    /// Where the original init image lives if it was never relocated
    #[serde(default = "default_relocate_from")]
    pub relocate_from: Option<PathBuf>,
    /// Check (and repair) the target before exec
    #[serde(default = "default_true")]
    pub verify_target: bool,
    /// Programs to exec into, highest priority first
    #[serde(default = "default_candidates")]
    pub candidates: Vec<HandoffCandidate>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            target: default_init_target(),
            relocate_from: default_relocate_from(),
            verify_target: true,
            candidates: default_candidates(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mounts() -> Vec<MountSpec> {
    vec![
        MountSpec::new("devtmpfs", "/dev", "devtmpfs")
            .with_flags(&[MountFlag::NoSuid])
            .with_options("mode=0755"),
        MountSpec::new("proc", "/proc", "proc").with_flags(&[
            MountFlag::NoDev,
            MountFlag::NoExec,
            MountFlag::NoSuid,
        ]),
        MountSpec::new("sysfs", "/sys", "sysfs").with_flags(&[
            MountFlag::NoDev,
            MountFlag::NoExec,
            MountFlag::NoSuid,
        ]),
    ]
}

fn default_device_nodes() -> Vec<DeviceNode> {
    vec![
        DeviceNode::char_device("/dev/console", 0o600, 5, 1),
        DeviceNode::char_device("/dev/kmsg", 0o600, 1, 11),
    ]
}

fn default_markers() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/metadata/cf_init/marker.log"),
        PathBuf::from("/cf_init_marker"),
        PathBuf::from("/tmp/cf_init_marker"),
    ]
}

fn default_console_path() -> PathBuf {
    PathBuf::from("/dev/console")
}

fn default_console_attempts() -> u32 {
    50
}

fn default_console_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_console_fallbacks() -> Vec<PathBuf> {
    vec![PathBuf::from("/dev/ttyS0")]
}

fn default_kmsg_path() -> PathBuf {
    PathBuf::from("/dev/kmsg")
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_init_target() -> PathBuf {
    PathBuf::from("/init.stock")
}

fn default_relocate_from() -> Option<PathBuf> {
    Some(PathBuf::from("/init"))
}

fn default_candidates() -> Vec<HandoffCandidate> {
    vec![
        HandoffCandidate::new("/init.stock", 30).forward_args(),
        HandoffCandidate::new("/system/bin/init", 20).forward_args(),
        HandoffCandidate::new("/system/bin/sh", 10).with_argv(&["sh"]),
    ]
}

/// Durations stored as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Durations stored as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BootConfig::default();
        assert_eq!(config.mode, BootMode::Handoff);
        assert_eq!(config.console.attempts, 50);
        assert_eq!(config.console.retry_delay, Duration::from_millis(100));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(5));

        let targets: Vec<&str> = config
            .mounts
            .iter()
            .map(|m| m.target.to_str().unwrap())
            .collect();
        assert_eq!(targets, vec!["/dev", "/proc", "/sys"]);

        assert_eq!(config.handoff.candidates.len(), 3);
        assert_eq!(config.handoff.candidates[0].path, PathBuf::from("/init.stock"));
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = BootConfig::from_toml("").unwrap();
        assert_eq!(config.mounts.len(), 3);
        assert_eq!(config.markers.len(), 3);
        assert!(config.sanity_checks);
    }

    #[test]
    fn test_partial_override() {
        let content = r#"
mode = "heartbeat"
sanity_checks = false

[heartbeat]
interval_secs = 2
handoff_after = 3

[console]
attempts = 5
fallbacks = ["/dev/hvc0", "/dev/ttyS0"]
"#;
        let config = BootConfig::from_toml(content).unwrap();
        assert_eq!(config.mode, BootMode::Heartbeat);
        assert!(!config.sanity_checks);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat.handoff_after, Some(3));
        assert_eq!(config.heartbeat.grace, Duration::from_millis(500));
        assert_eq!(config.console.attempts, 5);
        assert_eq!(config.console.retry_delay, Duration::from_millis(100));
        assert_eq!(config.console.fallbacks.len(), 2);
    }

    #[test]
    fn test_custom_candidates() {
        let content = r#"
[[handoff.candidates]]
path = "/sbin/init"
priority = 5
forward_args = true

[[handoff.candidates]]
path = "/bin/busybox"
argv = ["sh"]
priority = 1
"#;
        let config = BootConfig::from_toml(content).unwrap();
        assert_eq!(config.handoff.candidates.len(), 2);
        assert!(config.handoff.candidates[0].forward_args);
        assert_eq!(config.handoff.candidates[1].argv, vec!["sh".to_string()]);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let content = "[heartbeat]\ninterval_secs = 0\n";
        assert!(matches!(
            BootConfig::from_toml(content),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_malformed_file() {
        assert!(matches!(
            BootConfig::from_toml("mode = 12"),
            Err(Error::TomlParse(_))
        ));
    }
}
