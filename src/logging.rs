//! Tracing initialisation.
//!
//! Structured logging through `tracing` and `tracing-subscriber`, with
//! pretty, compact and JSON output. `RUST_LOG` overrides the configured
//! level, so protocol traffic can be switched on alone with
//! `RUST_LOG=axis_tool::protocol=debug`.
//!
//! # Example
//! ```no_run
//! use axis_tool::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("axis-tool started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{AppResult, AxisError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line format with colors (for interactive use)
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// JSON, one object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(AxisError::Configuration(format!(
                "invalid log format '{other}', must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to log span creation and close (request spans of the client)
    pub with_span_events: bool,
    /// Whether to include the target (`axis_tool::protocol`, ...)
    pub with_target: bool,
    /// Whether to enable ANSI colors (ignored for JSON)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from application configuration
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Create tracing config with a default level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from application configuration.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(TracingConfig::from_app_config(config)?)
}

/// Initialize tracing.
///
/// Idempotent: if a global subscriber is already set this returns `Ok(())`,
/// which keeps it safe to call from tests.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_target(config.with_target)
        .with_writer(std::io::stderr);

    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).with_filter(env_filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(config.with_ansi).with_filter(env_filter).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).with_filter(env_filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already initialised, expected in tests.
        Err(err) if err.to_string().contains("global default trace dispatcher has already been set") => Ok(()),
        Err(err) => Err(AxisError::Configuration(format!("failed to initialize tracing: {err}"))),
    }
}

/// Parse a log level name (case-insensitive).
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        AxisError::Configuration(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        ))
    })
}
