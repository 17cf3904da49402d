//! # Configuration Management
//!
//! Loads the settings file (`bus-stop.toml` by default) and validates it before anything
//! else starts. Unlike a silent fallback to defaults, a broken settings file is fatal: a
//! bus board quietly showing the wrong stop is worse than one showing an error.
//!
//! Every section except `stops` and `backend.url_template` may be omitted.

use crate::arrivals::DEFAULT_RECEIVE_BUFFER;
use crate::stops::{StopConfiguration, StopParseError, DEFAULT_BOARD_ROWS, DEFAULT_STALENESS_SECS};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings file used when no `--config` is given
pub const DEFAULT_CONFIG_PATH: &str = "bus-stop.toml";

/// The panel has room for this many schedule rows
pub const MAX_BOARD_ROWS: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad settings file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("cannot write settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{0:?} is a required setting")]
    Missing(&'static str),

    #[error("setting {field:?} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("stop line {line}: {reason}")]
    Stop {
        line: usize,
        #[source]
        reason: StopParseError,
    },
}

/// Application configuration loaded from the settings file
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// One line per logical stop, e.g. `"1001, 1002, default, name=Home"`
    #[serde(default)]
    pub stops: Vec<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Headsign replacements, matched exactly
    #[serde(default)]
    pub name_substitutions: HashMap<String, String>,
}

/// Schedule backend
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Request URL with `{}` where the stop id goes
    pub url_template: String,
    pub receive_buffer_bytes: usize,
    /// How long an empty answer is ignored after the last good one
    pub staleness_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url_template: String::new(),
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER,
            staleness_secs: DEFAULT_STALENESS_SECS as u64,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeConfig {
    /// SNTP servers, tried in order
    pub servers: Vec<String>,
    /// Apply the DST table to the displayed clock
    pub dst_correction: bool,
    pub timeout_secs: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            servers: vec!["0.pool.ntp.org".to_string(), "1.pool.ntp.org".to_string()],
            dst_correction: true,
            timeout_secs: 5,
        }
    }
}

/// Panel wiring and board layout
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub refresh_period_secs: u64,
    pub board_rows: usize,
    /// Route badges are at least this many characters wide
    pub designation_min_chars: usize,
    pub spi_device: String,
    pub spi_hz: u32,
    /// GPIO line offsets on the first gpiochip
    pub cs_pin: u32,
    pub reset_pin: Option<u32>,
    pub backlight_pin: Option<u32>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_period_secs: 5,
            board_rows: DEFAULT_BOARD_ROWS,
            designation_min_chars: 4,
            spi_device: "/dev/spidev0.0".to_string(),
            spi_hz: 1_100_000,
            cs_pin: 17,
            reset_pin: Some(16),
            backlight_pin: Some(20),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` that must accept a TCP connection before the first fetch
    pub probe_host: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stops: vec!["231291, default".to_string()],
            backend: BackendConfig {
                url_template: "http://localhost:8080/stops/{}".to_string(),
                ..BackendConfig::default()
            },
            time: TimeConfig::default(),
            display: DisplayConfig::default(),
            network: NetworkConfig::default(),
            log: LogConfig::default(),
            name_substitutions: HashMap::new(),
        }
    }
}

impl Config {
    /// Load and validate the settings file at `path`
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&contents)?;
        info!(
            "loaded {} stop(s) from {}",
            config.stops.len(),
            path.as_ref().display()
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stops.is_empty() {
            return Err(ConfigError::Missing("stops"));
        }
        self.stop_configurations()?;

        if self.backend.url_template.is_empty() {
            return Err(ConfigError::Missing("backend.url_template"));
        }
        if !self.backend.url_template.contains("{}") {
            return Err(ConfigError::Invalid {
                field: "backend.url_template",
                reason: "must contain {} for the stop id".to_string(),
            });
        }
        if self.backend.receive_buffer_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.receive_buffer_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.display.refresh_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "display.refresh_period_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(1..=MAX_BOARD_ROWS).contains(&self.display.board_rows) {
            return Err(ConfigError::Invalid {
                field: "display.board_rows",
                reason: format!("must be between 1 and {}", MAX_BOARD_ROWS),
            });
        }
        if self.display.spi_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "display.spi_hz",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Parse every stop line; the error names the first bad line (1-based).
    pub fn stop_configurations(&self) -> Result<Vec<StopConfiguration>, ConfigError> {
        self.stops
            .iter()
            .enumerate()
            .map(|(i, line)| {
                line.parse::<StopConfiguration>()
                    .map_err(|reason| ConfigError::Stop { line: i + 1, reason })
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.display.refresh_period_secs)
    }

    pub fn time_server_timeout(&self) -> Duration {
        Duration::from_secs(self.time.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs.unwrap_or(10))
    }

    /// Write the configuration as pretty TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        info!("configuration saved to {}", path.as_ref().display());
        Ok(())
    }
}
