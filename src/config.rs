//! Configuration system using Figment.
//!
//! This module provides strongly-typed configuration loading for the
//! application. Configuration is loaded from:
//! 1. `beamctl.toml` (base configuration)
//! 2. Environment variables (prefixed with `BEAMCTL_`)
//!
//! # Example
//! ```no_run
//! use beamctl::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! println!("Beamline: {}", settings.beamline.name);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::beamline::BeamlineOptions;
use crate::error::{AppResult, BeamlineError};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub beamline: BeamlineConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Logging format (pretty, compact, json).
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "beamctl".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Beamline geometry, tolerances and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamlineConfig {
    /// Beamline identifier reported to the LIMS.
    pub name: String,
    /// Root directory for acquired data.
    pub data_root: PathBuf,
    /// Energy moves below this delta (keV) are skipped between wedges.
    pub energy_tolerance: f64,
    /// Distance moves below this delta (mm) are skipped between wedges.
    pub distance_tolerance: f64,
    /// Settle delay between beam recovery and acquisition restart.
    #[serde(with = "humantime_serde")]
    pub beam_settle: Duration,
    /// Ceiling for a single goniometer scan beyond its raw exposure time.
    #[serde(with = "humantime_serde")]
    pub scan_overhead: Duration,
    /// Interval of the stuck-component liveness check.
    #[serde(with = "humantime_serde")]
    pub liveness_interval: Duration,
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        Self {
            name: "SIM-1".to_string(),
            data_root: default_data_root(),
            energy_tolerance: 0.0005,
            distance_tolerance: 0.1,
            beam_settle: Duration::from_secs(30),
            scan_overhead: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(10),
        }
    }
}

/// Automation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Skip operator interventions; failed samples are skipped instead.
    pub unattended: bool,
    /// Minimum acceptable centering quality score, in percent.
    pub centering_threshold: f64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            unattended: false,
            centering_threshold: 70.0,
        }
    }
}

fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("beamctl")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            beamline: BeamlineConfig::default(),
            automation: AutomationConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from `beamctl.toml` and environment variables.
    ///
    /// Environment variables override file values with prefix `BEAMCTL_`,
    /// e.g. `BEAMCTL_APPLICATION_LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("beamctl.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMCTL_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BeamlineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(BeamlineError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }
        if self.beamline.energy_tolerance <= 0.0 || self.beamline.distance_tolerance <= 0.0 {
            return Err(BeamlineError::Configuration(
                "Motion tolerances must be positive".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.automation.centering_threshold) {
            return Err(BeamlineError::Configuration(format!(
                "Invalid centering_threshold {}. Must be 0-100",
                self.automation.centering_threshold
            )));
        }
        Ok(())
    }

    /// Motion and timing options for engine construction.
    pub fn beamline_options(&self) -> BeamlineOptions {
        BeamlineOptions {
            energy_tolerance: self.beamline.energy_tolerance,
            distance_tolerance: self.beamline.distance_tolerance,
            beam_settle: self.beamline.beam_settle,
            scan_overhead: self.beamline.scan_overhead,
        }
    }
}
