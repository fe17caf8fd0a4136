//! Tracing infrastructure.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`:
//! - structured events with fields on every engine and device transition
//! - multiple output formats (pretty, compact, JSON)
//! - environment-based filtering via `RUST_LOG`
//! - initialization from the application configuration
//!
//! # Example
//! ```no_run
//! use beamctl::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!("application started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::Settings;

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development).
    Pretty,
    /// Compact format without colors (for production).
    Compact,
    /// JSON format for structured logging (for log aggregation).
    Json,
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Whether to include thread names.
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Derive tracing settings from the application configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = parse_log_level(&settings.application.log_level)?;
        let format = parse_format(&settings.application.log_format)?;
        Ok(Self {
            level,
            format,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!("Unknown log level '{other}'")),
    }
}

fn parse_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        other => Err(format!("Unknown log format '{other}'")),
    }
}

/// Initialize the global subscriber from a tracing configuration.
///
/// `RUST_LOG` overrides the configured level when set. Returns an error if a
/// global subscriber is already installed.
pub fn init(config: &TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|err| format!("failed to install subscriber: {err}"))
}

/// Initialize tracing straight from the application configuration.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(&TracingConfig::from_settings(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("info").ok(), Some(Level::INFO));
        assert_eq!(parse_log_level("DEBUG").ok(), Some(Level::DEBUG));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("json").ok(), Some(OutputFormat::Json));
        assert!(parse_format("yaml").is_err());
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings::default();
        let config = TracingConfig::from_settings(&settings).expect("config");
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, OutputFormat::Pretty);
    }
}
