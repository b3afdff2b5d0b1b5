//! Device configuration – reads/writes `~/.photon/config.toml`.
//!
//! Every section and field has a serde default, so a partial file (or none
//! at all) yields a working configuration.
//!
//! ```toml
//! log_format = "compact"
//!
//! [watchdog]
//! interval_ms = 500
//! timeout_multiple = 2
//!
//! [monitor]
//! interval_ms = 100
//! debounce_threshold = 3
//!
//! [engine]
//! action_timeout_ms = 2000
//! max_retries = 2
//! retry_delay_ms = 100
//! wait_slice_ms = 50
//!
//! [limits]
//! max_output_level = 10.0
//! travel_min = -50.0
//! travel_max = 50.0
//! max_dwell_ms = 600000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use photon_kernel::{
    ActionVerifier, DwellLimitRule, MonitorConfig, OutputCapRule, TravelLimitRule, WatchdogConfig,
};
use photon_runtime::telemetry::LogFormat;
use photon_runtime::{EngineConfig, RetryPolicy};

/// Floor for `engine.action_timeout_ms`; zero would time out every call.
const MIN_ACTION_TIMEOUT_MS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub interval_ms: u64,
    /// Hardware timeout in heartbeat intervals.
    pub timeout_multiple: u32,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            timeout_multiple: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_ms: u64,
    /// Consecutive positive samples before a sensor condition asserts.
    pub debounce_threshold: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            debounce_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub action_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub wait_slice_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            action_timeout_ms: 2000,
            max_retries: 2,
            retry_delay_ms: 100,
            wait_slice_ms: 50,
        }
    }
}

/// Load-time limits applied to every protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_output_level: f64,
    pub travel_min: f64,
    pub travel_max: f64,
    pub max_dwell_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_output_level: 10.0,
            travel_min: -50.0,
            travel_max: 50.0,
            max_dwell_ms: 600_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted device configuration stored in `~/.photon/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `"compact"` or `"json"`.  `PHOTON_LOG_FORMAT` wins when set.
    pub log_format: String,
    pub watchdog: WatchdogSection,
    pub monitor: MonitorSection,
    pub engine: EngineSection,
    pub limits: LimitsSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default().to_string(),
            watchdog: WatchdogSection::default(),
            monitor: MonitorSection::default(),
            engine: EngineSection::default(),
            limits: LimitsSection::default(),
        }
    }
}

impl Config {
    pub fn log_format(&self) -> LogFormat {
        self.log_format.parse().unwrap_or_default()
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            timeout_multiple: self.watchdog.timeout_multiple.max(1),
            ..WatchdogConfig::with_interval(Duration::from_millis(self.watchdog.interval_ms.max(1)))
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(self.monitor.interval_ms.max(1)),
            threshold: self.monitor.debounce_threshold,
            ..MonitorConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            action_timeout: Duration::from_millis(self.engine.action_timeout_ms.max(MIN_ACTION_TIMEOUT_MS)),
            retry: RetryPolicy {
                max_retries: self.engine.max_retries,
                delay: Duration::from_millis(self.engine.retry_delay_ms),
            },
            wait_slice: Duration::from_millis(self.engine.wait_slice_ms.max(1)),
        }
    }

    /// Verifier carrying the output cap, travel and dwell rules.
    pub fn verifier(&self) -> ActionVerifier {
        let mut verifier = ActionVerifier::new();
        verifier.add_rule(Box::new(OutputCapRule {
            max_level: self.limits.max_output_level,
        }));
        verifier.add_rule(Box::new(TravelLimitRule {
            min: self.limits.travel_min,
            max: self.limits.travel_max,
        }));
        verifier.add_rule(Box::new(DwellLimitRule {
            max_ms: self.limits.max_dwell_ms,
        }));
        verifier
    }
}

/// Return the path to `~/.photon/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".photon").join("config.toml")
}

/// Load the config, falling back to defaults when the file is absent.
/// Environment overrides are applied either way.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `PHOTON_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PHOTON_HEARTBEAT_MS` | `watchdog.interval_ms` |
/// | `PHOTON_ACTION_TIMEOUT_MS` | `engine.action_timeout_ms` |
/// | `PHOTON_MAX_OUTPUT_LEVEL` | `limits.max_output_level` |
/// | `PHOTON_DEBOUNCE_THRESHOLD` | `monitor.debounce_threshold` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parse("PHOTON_HEARTBEAT_MS") {
        cfg.watchdog.interval_ms = v;
    }
    if let Some(v) = env_parse("PHOTON_ACTION_TIMEOUT_MS") {
        cfg.engine.action_timeout_ms = v;
    }
    if let Some(v) = env_parse::<f64>("PHOTON_MAX_OUTPUT_LEVEL")
        && v.is_finite()
    {
        cfg.limits.max_output_level = v;
    }
    if let Some(v) = env_parse("PHOTON_DEBOUNCE_THRESHOLD") {
        cfg.monitor.debounce_threshold = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.photon/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only (rw-------): the file carries device limits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
