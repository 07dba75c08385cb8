//! Configuration loading using Figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (default `config/axis-tool.toml`, missing file is fine)
//! 2. environment variables prefixed with `AXIS_TOOL_`, nested keys split on `__`
//!
//! Every section has defaults, so an empty configuration is valid.
//!
//! # Example
//! ```no_run
//! use axis_tool::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Controller: {}:{}", config.controller.host, config.controller.port);
//! # Ok(())
//! # }
//! ```

use crate::axis::AxisDefinition;
use crate::bss::NetworkSettings;
use crate::error::{AppResult, AxisError};
use crate::scheduler::PollingConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/axis-tool.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Controller endpoint
    pub controller: ControllerConfig,
    /// Scheduler timing
    pub polling: PollingSettings,
    /// Inline axis definitions, merged over the bss.config catalog
    pub axes: Vec<AxisDefinition>,
    /// YAML group files, later files override earlier groups of the same name
    pub group_files: Vec<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "axis-tool".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Controller endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller host name or address
    pub host: String,
    /// Controller TCP port
    pub port: u16,
    /// Device object prefix of every axis (e.g. `bl_41in`)
    pub device_object: String,
    /// Per-exchange timeout in milliseconds
    pub timeout_ms: u64,
    /// Beamline bss.config; `$BLCONFIG/bss/bss.config` when unset
    pub bss_config: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "10.178.215.3".to_string(),
            port: 10101,
            device_object: "bl_41in".to_string(),
            timeout_ms: 2000,
            bss_config: None,
        }
    }
}

impl ControllerConfig {
    /// Exchange timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Path of the bss.config to read.
    pub fn bss_path(&self) -> PathBuf {
        self.bss_config.clone().unwrap_or_else(|| {
            let root = std::env::var_os("BLCONFIG").unwrap_or_else(|| "/blconfig".into());
            PathBuf::from(root).join("bss").join("bss.config")
        })
    }

    /// Take host, port and device object from bss.config network settings.
    pub fn apply_network(&mut self, network: &NetworkSettings) {
        if let Some(host) = &network.host {
            self.host.clone_from(host);
        }
        if let Some(port) = network.port {
            self.port = port;
        }
        if let Some(object) = &network.device_object {
            self.device_object.clone_from(object);
        }
    }
}

/// Scheduler timing, in configuration units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Re-poll interval while moving (at most 1000 ms)
    pub moving_interval_ms: u64,
    /// Re-poll interval after an error state
    pub error_interval_ms: u64,
    /// Delay before a post-move confirmation retry
    pub confirm_delay_ms: u64,
    /// Post-move confirmation retries
    pub confirm_max_retries: u32,
    /// Accepted deviation from the move target, in pulses
    pub confirm_tolerance_pulses: f64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        let defaults = PollingConfig::default();
        Self {
            moving_interval_ms: duration_ms(defaults.moving_interval),
            error_interval_ms: duration_ms(defaults.error_interval),
            confirm_delay_ms: duration_ms(defaults.confirm_delay),
            confirm_max_retries: defaults.confirm_max_retries,
            confirm_tolerance_pulses: defaults.confirm_tolerance,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PollingSettings {
    /// Longest allowed moving interval.
    pub const MAX_MOVING_INTERVAL_MS: u64 = 1000;

    /// Convert to the scheduler's representation.
    pub fn to_polling_config(&self) -> PollingConfig {
        PollingConfig {
            moving_interval: Duration::from_millis(self.moving_interval_ms),
            error_interval: Duration::from_millis(self.error_interval_ms),
            confirm_delay: Duration::from_millis(self.confirm_delay_ms),
            confirm_max_retries: self.confirm_max_retries,
            confirm_tolerance: self.confirm_tolerance_pulses,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and environment variables.
    ///
    /// Environment variables override the file, e.g.
    /// `AXIS_TOOL_CONTROLLER__HOST=127.0.0.1`.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AXIS_TOOL_").split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(AxisError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }

        if self.controller.port == 0 {
            return Err(AxisError::Configuration("controller port cannot be 0".into()));
        }
        if self.controller.timeout_ms == 0 {
            return Err(AxisError::Configuration("controller timeout_ms must be > 0".into()));
        }
        if self.controller.device_object.trim().is_empty() {
            return Err(AxisError::Configuration("controller device_object cannot be empty".into()));
        }

        if self.polling.moving_interval_ms == 0
            || self.polling.moving_interval_ms > PollingSettings::MAX_MOVING_INTERVAL_MS
        {
            return Err(AxisError::Configuration(format!(
                "moving_interval_ms {} must be within 1-{}",
                self.polling.moving_interval_ms,
                PollingSettings::MAX_MOVING_INTERVAL_MS
            )));
        }
        if !(self.polling.confirm_tolerance_pulses.is_finite() && self.polling.confirm_tolerance_pulses >= 0.0) {
            return Err(AxisError::Configuration(format!(
                "confirm_tolerance_pulses {} must be a non-negative number",
                self.polling.confirm_tolerance_pulses
            )));
        }

        let mut names = HashSet::new();
        for axis in &self.axes {
            axis.validate()?;
            if !names.insert(axis.name.as_str()) {
                return Err(AxisError::Configuration(format!("duplicate axis '{}'", axis.name)));
            }
        }
        Ok(())
    }
}
