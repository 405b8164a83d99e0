//! Configuration management for mirrorhost
//!
//! Handles loading and validation of `mirrorhost.toml`. Every field has a
//! default, so an empty file (or no file at all) yields a working setup.
//!
//! ```toml
//! [sink]
//! host = "zabbix-dest.example"
//! port = 10051
//!
//! [replay]
//! window_hours = 24
//! tick_interval_secs = 60
//!
//! [faults]
//! probability = 0.1
//! min_ticks = 2
//! max_ticks = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MIRRORHOST_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Destination trapper endpoint
    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    /// Synthetic fault injection
    #[serde(default)]
    pub faults: FaultConfig,

    /// Item ingestion filter
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".mirrorhost"), |d| d.join("mirrorhost"))
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path (defaults to `<data_dir>/mirrorhost.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// SQLite busy timeout applied to every connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Attempts per commit before contention is surfaced
    #[serde(default = "default_commit_max_attempts")]
    pub commit_max_attempts: u32,

    /// Base backoff delay between commit attempts
    #[serde(default = "default_commit_base_delay_ms")]
    pub commit_base_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            commit_max_attempts: default_commit_max_attempts(),
            commit_base_delay_ms: default_commit_base_delay_ms(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_commit_max_attempts() -> u32 {
    5
}

fn default_commit_base_delay_ms() -> u64 {
    100
}

impl StorageConfig {
    /// Retry policy applied to every store commit.
    #[must_use]
    pub fn commit_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.commit_base_delay_ms),
            max_attempts: Some(self.commit_max_attempts),
            ..RetryPolicy::storage_commit()
        }
    }
}

/// Destination trapper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Trapper host (destination server address)
    #[serde(default = "default_sink_host")]
    pub host: String,

    #[serde(default = "default_sink_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: default_sink_host(),
            port: default_sink_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

fn default_sink_host() -> String {
    "127.0.0.1".to_string()
}

fn default_sink_port() -> u16 {
    10051
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    15_000
}

/// Replay scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Replay window; a window restart happens once this much time has passed
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Seconds between ticks for one source host
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// History fetched on initial replication
    #[serde(default = "default_initial_history_hours")]
    pub initial_history_hours: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            tick_interval_secs: default_tick_interval_secs(),
            initial_history_hours: default_initial_history_hours(),
        }
    }
}

fn default_window_hours() -> u64 {
    24
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_initial_history_hours() -> u64 {
    12
}

impl ReplayConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours.saturating_mul(3600))
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Fault injection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Chance per tick that an idle eligible item starts a problem
    #[serde(default = "default_fault_probability")]
    pub probability: f64,

    #[serde(default = "default_fault_min_ticks")]
    pub min_ticks: u32,

    #[serde(default = "default_fault_max_ticks")]
    pub max_ticks: u32,

    /// Fixed RNG seed (tests and reproducible demos)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probability: default_fault_probability(),
            min_ticks: default_fault_min_ticks(),
            max_ticks: default_fault_max_ticks(),
            seed: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fault_probability() -> f64 {
    0.1
}

fn default_fault_min_ticks() -> u32 {
    2
}

fn default_fault_max_ticks() -> u32 {
    5
}

/// Item filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Item keys starting with any of these are never replicated
    #[serde(default = "default_excluded_key_prefixes")]
    pub excluded_key_prefixes: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            excluded_key_prefixes: default_excluded_key_prefixes(),
        }
    }
}

fn default_excluded_key_prefixes() -> Vec<String> {
    vec!["MTR".to_string()]
}

impl Config {
    /// Load configuration from the default locations.
    ///
    /// Order: `$MIRRORHOST_CONFIG`, `<config_dir>/mirrorhost/mirrorhost.toml`,
    /// built-in defaults. Environment overrides are applied last.
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = explicit.or_else(|| {
            dirs::config_dir()
                .map(|d| d.join("mirrorhost").join("mirrorhost.toml"))
                .filter(|p| p.exists())
        });

        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file (no env overrides).
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MIRRORHOST_*` overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MIRRORHOST_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Some(host) = lookup("MIRRORHOST_SINK_HOST") {
            self.sink.host = host;
        }
        if let Some(port) = lookup("MIRRORHOST_SINK_PORT") {
            self.sink.port = parse_override("MIRRORHOST_SINK_PORT", &port)?;
        }
        if let Some(hours) = lookup("MIRRORHOST_REPLAY_WINDOW_HOURS") {
            self.replay.window_hours = parse_override("MIRRORHOST_REPLAY_WINDOW_HOURS", &hours)?;
        }
        if let Some(secs) = lookup("MIRRORHOST_TICK_INTERVAL_SECS") {
            self.replay.tick_interval_secs =
                parse_override("MIRRORHOST_TICK_INTERVAL_SECS", &secs)?;
        }
        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> crate::Result<()> {
        fn invalid(msg: String) -> crate::Result<()> {
            Err(ConfigError::ValidationError(msg).into())
        }

        if !(0.0..=1.0).contains(&self.faults.probability) {
            return invalid(format!(
                "faults.probability must be within [0, 1], got {}",
                self.faults.probability
            ));
        }
        if self.faults.min_ticks == 0 || self.faults.min_ticks > self.faults.max_ticks {
            return invalid(format!(
                "faults.min_ticks ({}) must be >= 1 and <= faults.max_ticks ({})",
                self.faults.min_ticks, self.faults.max_ticks
            ));
        }
        if self.replay.window_hours == 0 {
            return invalid("replay.window_hours must be > 0".to_string());
        }
        if self.replay.tick_interval_secs == 0 {
            return invalid("replay.tick_interval_secs must be > 0".to_string());
        }
        if self.sink.port == 0 {
            return invalid("sink.port must be > 0".to_string());
        }
        if self.sink.host.trim().is_empty() {
            return invalid("sink.host must not be empty".to_string());
        }
        if self.storage.commit_max_attempts == 0 {
            return invalid("storage.commit_max_attempts must be > 0".to_string());
        }
        Ok(())
    }

    /// Resolved database path.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("mirrorhost.db"))
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{key} has an invalid value: {value}")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.sink.port, 10051);
        assert_eq!(config.replay.window_hours, 24);
        assert_eq!(config.replay.tick_interval_secs, 60);
        assert_eq!(config.replay.initial_history_hours, 12);
        assert!((config.faults.probability - 0.1).abs() < f64::EPSILON);
        assert_eq!((config.faults.min_ticks, config.faults.max_ticks), (2, 5));
        assert_eq!(config.filter.excluded_key_prefixes, vec!["MTR".to_string()]);
        assert_eq!(config.storage.commit_max_attempts, 5);
        assert_eq!(config.storage.commit_base_delay_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sink.port, 10051);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [sink]
            host = "dest.example"

            [faults]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sink.host, "dest.example");
        assert_eq!(config.sink.port, 10051);
        assert!(!config.faults.enabled);
        assert_eq!(config.faults.max_ticks, 5);
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let err = Config::from_toml("[faults]\nprobability = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("faults.probability"));
    }

    #[test]
    fn rejects_inverted_fault_duration() {
        let err = Config::from_toml("[faults]\nmin_ticks = 6\nmax_ticks = 3\n").unwrap_err();
        assert!(err.to_string().contains("min_ticks"));
    }

    #[test]
    fn rejects_zero_window() {
        assert!(Config::from_toml("[replay]\nwindow_hours = 0\n").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = Config::from_toml("[sink\nport = 1").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MIRRORHOST_SINK_HOST", "10.0.0.9"),
            ("MIRRORHOST_SINK_PORT", "20051"),
            ("MIRRORHOST_REPLAY_WINDOW_HOURS", "6"),
            ("MIRRORHOST_DB_PATH", "/tmp/mh.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.sink.host, "10.0.0.9");
        assert_eq!(config.sink.port, 20051);
        assert_eq!(config.replay.window(), Duration::from_secs(6 * 3600));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/mh.db"));
    }

    #[test]
    fn env_override_rejects_garbage_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|k| {
            (k == "MIRRORHOST_SINK_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn load_from_missing_file_errors() {
        let err = Config::load_from(Path::new("/nonexistent/mirrorhost.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn db_path_defaults_under_data_dir() {
        let mut config = Config::default();
        config.general.data_dir = PathBuf::from("/var/lib/mh");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/mh/mirrorhost.db"));
    }

    #[test]
    fn commit_policy_follows_storage_section() {
        let mut config = Config::default();
        config.storage.commit_max_attempts = 7;
        config.storage.commit_base_delay_ms = 20;
        let policy = config.storage.commit_policy();
        assert_eq!(policy.max_attempts, Some(7));
        assert_eq!(policy.initial_delay, Duration::from_millis(20));
    }
}
