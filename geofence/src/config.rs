//! Engine configuration and its INI file representation.
//!
//! ```ini
//! [monitor]
//! tick_interval_ms = 2000
//! rescan_period = 10
//! rescan_margin_km = 75
//! move_threshold_m = 2.0
//! auto_dismiss = false
//! default_range_km = 75
//! max_range_km = 2000
//!
//! [persistence]
//! directory = /var/lib/geofence
//!
//! [logging]
//! filter = geofence=info
//! directory = /var/log/geofence
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::fence::{DEFAULT_RANGE_KM, MAX_RANGE_KM};
use crate::monitor::DEFAULT_MOVE_THRESHOLD_M;

/// Default time between monitor sweeps.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(2000);

/// Default number of ticks between candidate rescans.
pub const DEFAULT_RESCAN_PERIOD: u64 = 10;

/// Default margin added to a fence's extent when rescanning, in km.
pub const DEFAULT_RESCAN_MARGIN_KM: u32 = 75;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "geofence=info";

const CONFIG_DIR: &str = ".geofence";
const CONFIG_FILE: &str = "config.ini";

const SECTION_MONITOR: &str = "monitor";
const SECTION_PERSISTENCE: &str = "persistence";
const SECTION_LOGGING: &str = "logging";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("Failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// The file could not be written.
    #[error("Failed to write config {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    /// A key holds a value that does not parse or is out of range.
    #[error("Invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

fn invalid(section: &str, key: &str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Monitoring engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Time between monitor sweeps.
    pub tick_interval: Duration,
    /// Ticks between candidate rescans.
    pub rescan_period: u64,
    /// Margin added to a fence's extent on rescan, in km.
    pub rescan_margin_km: u32,
    /// Movement below which a polygon monitor skips the index write.
    pub move_threshold_m: f64,
    /// Whether an alert batch replaces prior alerts and empty sweeps clear
    /// them.
    pub auto_dismiss: bool,
    /// Range used when a fence's range estimate is bogus.
    pub default_range_km: u32,
    /// Upper bound on fence ranges.
    pub max_range_km: u32,
    /// Where [`crate::persist::JsonFilePersistence`] stores monitor state.
    pub persist_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            rescan_period: DEFAULT_RESCAN_PERIOD,
            rescan_margin_km: DEFAULT_RESCAN_MARGIN_KM,
            move_threshold_m: DEFAULT_MOVE_THRESHOLD_M,
            auto_dismiss: false,
            default_range_km: DEFAULT_RANGE_KM,
            max_range_km: MAX_RANGE_KM,
            persist_dir: None,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the rescan period. Zero is treated as 1 (rescan every tick).
    pub fn with_rescan_period(mut self, period: u64) -> Self {
        self.rescan_period = period.max(1);
        self
    }

    pub fn with_rescan_margin_km(mut self, margin_km: u32) -> Self {
        self.rescan_margin_km = margin_km;
        self
    }

    pub fn with_move_threshold_m(mut self, threshold_m: f64) -> Self {
        self.move_threshold_m = threshold_m;
        self
    }

    pub fn with_auto_dismiss(mut self, auto_dismiss: bool) -> Self {
        self.auto_dismiss = auto_dismiss;
        self
    }

    pub fn with_default_range_km(mut self, range_km: u32) -> Self {
        self.default_range_km = range_km;
        self
    }

    pub fn with_max_range_km(mut self, range_km: u32) -> Self {
        self.max_range_km = range_km;
        self
    }

    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when `None`.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

/// Everything read from a config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// `~/.geofence/config.ini`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
}

fn parse_key<T>(props: &Properties, section: &str, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(section, key, raw, e.to_string())),
    }
}

fn parse_bool(props: &Properties, section: &str, key: &str) -> Result<Option<bool>, ConfigError> {
    match props.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(invalid(section, key, v, "expected true or false")),
        },
    }
}

fn non_empty_path(props: &Properties, key: &str) -> Option<PathBuf> {
    props
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

impl ConfigFile {
    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Load `path`, or the default path when `None`. A missing default file
    /// yields the defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(props) = ini.section(Some(SECTION_MONITOR)) {
            let s = SECTION_MONITOR;
            let m = &mut config.monitor;

            if let Some(ms) = parse_key::<u64>(props, s, "tick_interval_ms")? {
                if ms == 0 {
                    return Err(invalid(s, "tick_interval_ms", ms, "must be positive"));
                }
                m.tick_interval = Duration::from_millis(ms);
            }
            if let Some(period) = parse_key::<u64>(props, s, "rescan_period")? {
                if period == 0 {
                    return Err(invalid(s, "rescan_period", period, "must be at least 1"));
                }
                m.rescan_period = period;
            }
            if let Some(margin) = parse_key(props, s, "rescan_margin_km")? {
                m.rescan_margin_km = margin;
            }
            if let Some(threshold) = parse_key::<f64>(props, s, "move_threshold_m")? {
                if !threshold.is_finite() || threshold < 0.0 {
                    return Err(invalid(s, "move_threshold_m", threshold, "must be a non-negative number"));
                }
                m.move_threshold_m = threshold;
            }
            if let Some(auto) = parse_bool(props, s, "auto_dismiss")? {
                m.auto_dismiss = auto;
            }
            if let Some(max) = parse_key::<u32>(props, s, "max_range_km")? {
                if max == 0 {
                    return Err(invalid(s, "max_range_km", max, "must be positive"));
                }
                m.max_range_km = max;
            }
            if let Some(default) = parse_key::<u32>(props, s, "default_range_km")? {
                if default == 0 || default > m.max_range_km {
                    return Err(invalid(
                        s,
                        "default_range_km",
                        default,
                        format!("must be between 1 and {}", m.max_range_km),
                    ));
                }
                m.default_range_km = default;
            }
        }

        if let Some(props) = ini.section(Some(SECTION_PERSISTENCE)) {
            config.monitor.persist_dir = non_empty_path(props, "directory");
        }

        if let Some(props) = ini.section(Some(SECTION_LOGGING)) {
            if let Some(filter) = props.get("filter").map(str::trim).filter(|f| !f.is_empty()) {
                config.logging.filter = filter.to_string();
            }
            config.logging.directory = non_empty_path(props, "directory");
        }

        Ok(config)
    }

    /// Render as INI.
    pub fn to_ini(&self) -> Ini {
        let m = &self.monitor;
        let mut ini = Ini::new();
        ini.with_section(Some(SECTION_MONITOR))
            .set("tick_interval_ms", m.tick_interval.as_millis().to_string())
            .set("rescan_period", m.rescan_period.to_string())
            .set("rescan_margin_km", m.rescan_margin_km.to_string())
            .set("move_threshold_m", m.move_threshold_m.to_string())
            .set("auto_dismiss", m.auto_dismiss.to_string())
            .set("default_range_km", m.default_range_km.to_string())
            .set("max_range_km", m.max_range_km.to_string());
        if let Some(dir) = &m.persist_dir {
            ini.with_section(Some(SECTION_PERSISTENCE))
                .set("directory", dir.display().to_string());
        }
        let mut logging = ini.with_section(Some(SECTION_LOGGING));
        logging.set("filter", self.logging.filter.clone());
        if let Some(dir) = &self.logging.directory {
            logging.set("directory", dir.display().to_string());
        }
        ini
    }

    /// Write to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        self.to_ini()
            .write_to_file(path)
            .map_err(|e| write_err(e.to_string()))
    }
}
