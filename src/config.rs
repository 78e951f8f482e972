//! Beamline Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/beamline.toml` (base configuration)
//! 2. Environment variables prefixed with `MX_DAQ_`, using `__` between nesting
//!    levels (e.g. `MX_DAQ_ACQUISITION__READINESS_ATTEMPTS=60`)
//!
//! Every bounded wait in the procedures takes its interval and attempt cap from
//! here, so a stuck device fails into an observable timeout instead of hanging.
//!
//! # Example
//! ```no_run
//! use mx_daq::config::BeamlineConfig;
//!
//! let config = BeamlineConfig::load()?;
//! config.validate()?;
//! println!("Beamline: {}", config.application.name);
//! # Ok::<(), mx_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level beamline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Motion polling and scan bounds
    #[serde(default)]
    pub motion: MotionConfig,
    /// Axes available for beam centering
    #[serde(default)]
    pub centering: CenteringConfig,
    /// Rotation data collection timing
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Monochromator and detector threshold coordination
    #[serde(default)]
    pub energy: EnergyConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Beamline name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Polling and retry bounds shared by every motion wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Interval between busy-flag polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Polls after a relative move before an unchanged readback counts as a physical limit
    #[serde(default = "default_max_move_tries")]
    pub max_move_tries: u32,
    /// Busy-flag polls allowed before a settle wait times out
    #[serde(default = "default_settle_attempts")]
    pub settle_attempts: u32,
    /// Upper bound on the number of steps in a single scan
    #[serde(default = "default_max_scan_steps")]
    pub max_scan_steps: u32,
}

/// Beam centering axes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CenteringConfig {
    /// Axes in the order a UI presents them
    #[serde(default)]
    pub axes: Vec<CenteringAxisConfig>,
}

/// One axis/counter pair that can be centred
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenteringAxisConfig {
    /// Logical axis name
    pub name: String,
    /// Counter sampled while scanning this axis
    pub counter: String,
    /// Factor applied to counter readings before comparison (-1 for inverted bias)
    #[serde(default = "default_bias")]
    pub bias: f64,
    /// Position a full-path scan starts from; the soft limit when absent
    #[serde(default)]
    pub full_path_edge: Option<f64>,
    /// Default half-width of the sweep offered to operators
    #[serde(default)]
    pub default_distance: Option<f64>,
    /// Default step offered to operators
    #[serde(default)]
    pub default_step: Option<f64>,
}

/// Data collection timing and detector handshake bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Detector connection polls before the detector is declared unavailable
    #[serde(default = "default_detector_attempts")]
    pub readiness_attempts: u32,
    /// Interval between detector connection polls in milliseconds
    #[serde(default = "default_detector_interval")]
    pub readiness_interval_ms: u64,
    /// Polls waiting for a previous acquisition to finish before forcing a stop
    #[serde(default = "default_detector_attempts")]
    pub busy_attempts: u32,
    /// Interval between busy polls in milliseconds
    #[serde(default = "default_detector_interval")]
    pub busy_interval_ms: u64,
    /// Polls waiting for the shutter to report open
    #[serde(default = "default_shutter_attempts")]
    pub shutter_confirm_attempts: u32,
    /// Interval between shutter polls in milliseconds
    #[serde(default = "default_shutter_interval")]
    pub shutter_confirm_interval_ms: u64,
    /// Detector readout time added to every exposure, in seconds
    #[serde(default = "default_readout")]
    pub readout_per_image_s: f64,
    /// Margin added to the exposure to obtain the acquire period, in seconds
    #[serde(default = "default_readout")]
    pub period_margin_s: f64,
    /// Pause between the commands of a forced detector stop, in milliseconds
    #[serde(default = "default_force_stop_delay")]
    pub force_stop_delay_ms: u64,
    /// Grace period for file transfers before remote cleanup, in milliseconds
    #[serde(default = "default_staging_grace")]
    pub staging_grace_ms: u64,
    /// Longest time without a new frame before the collection fails, in milliseconds
    #[serde(default = "default_trigger_timeout")]
    pub trigger_timeout_ms: u64,
}

/// Monochromator/threshold coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Monochromator crystal 2d spacing in Å; required to drive energy
    #[serde(default)]
    pub d_spacing: Option<f64>,
    /// Detector threshold as a fraction of the beam energy
    #[serde(default = "default_threshold_fraction")]
    pub threshold_fraction: f64,
    /// Threshold differences below this (keV) do not trigger a change
    #[serde(default = "default_threshold_tolerance")]
    pub threshold_tolerance_kev: f64,
    /// Time the detector needs after a threshold change, in seconds
    #[serde(default = "default_threshold_settle")]
    pub threshold_settle_s: f64,
    /// Longest wait for a previous threshold change, in seconds
    #[serde(default = "default_threshold_wait")]
    pub threshold_wait_timeout_s: f64,
    /// Interval between settle polls in milliseconds
    #[serde(default = "default_detector_interval")]
    pub poll_interval_ms: u64,
    /// Polls before waiting for energy and threshold to settle times out
    #[serde(default = "default_energy_attempts")]
    pub settle_attempts: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    50
}

fn default_max_move_tries() -> u32 {
    15
}

fn default_settle_attempts() -> u32 {
    1200
}

fn default_max_scan_steps() -> u32 {
    10_000
}

fn default_bias() -> f64 {
    1.0
}

fn default_detector_attempts() -> u32 {
    120
}

fn default_detector_interval() -> u64 {
    500
}

fn default_shutter_attempts() -> u32 {
    50
}

fn default_shutter_interval() -> u64 {
    100
}

fn default_readout() -> f64 {
    0.0023
}

fn default_force_stop_delay() -> u64 {
    2000
}

fn default_staging_grace() -> u64 {
    5000
}

fn default_trigger_timeout() -> u64 {
    10_000
}

fn default_threshold_fraction() -> f64 {
    0.5
}

fn default_threshold_tolerance() -> f64 {
    0.1
}

fn default_threshold_settle() -> f64 {
    30.0
}

fn default_threshold_wait() -> f64 {
    60.0
}

fn default_energy_attempts() -> u32 {
    240
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_move_tries: default_max_move_tries(),
            settle_attempts: default_settle_attempts(),
            max_scan_steps: default_max_scan_steps(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            readiness_attempts: default_detector_attempts(),
            readiness_interval_ms: default_detector_interval(),
            busy_attempts: default_detector_attempts(),
            busy_interval_ms: default_detector_interval(),
            shutter_confirm_attempts: default_shutter_attempts(),
            shutter_confirm_interval_ms: default_shutter_interval(),
            readout_per_image_s: default_readout(),
            period_margin_s: default_readout(),
            force_stop_delay_ms: default_force_stop_delay(),
            staging_grace_ms: default_staging_grace(),
            trigger_timeout_ms: default_trigger_timeout(),
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            d_spacing: None,
            threshold_fraction: default_threshold_fraction(),
            threshold_tolerance_kev: default_threshold_tolerance(),
            threshold_settle_s: default_threshold_settle(),
            threshold_wait_timeout_s: default_threshold_wait(),
            poll_interval_ms: default_detector_interval(),
            settle_attempts: default_energy_attempts(),
        }
    }
}

impl MotionConfig {
    /// Interval between busy-flag polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EnergyConfig {
    /// Settle latency of a detector threshold change.
    pub fn threshold_settle(&self) -> Duration {
        Duration::from_secs_f64(self.threshold_settle_s)
    }

    /// Cap on waiting for a previous threshold change.
    pub fn threshold_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.threshold_wait_timeout_s)
    }
}

impl CenteringConfig {
    /// Look up an axis by name.
    pub fn axis(&self, name: &str) -> Option<&CenteringAxisConfig> {
        self.axes.iter().find(|a| a.name == name)
    }
}

impl BeamlineConfig {
    /// Load configuration from `config/beamline.toml` and environment variables
    ///
    /// Example override: `MX_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/beamline.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MX_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let caps = [
            ("motion.max_move_tries", self.motion.max_move_tries),
            ("motion.settle_attempts", self.motion.settle_attempts),
            ("motion.max_scan_steps", self.motion.max_scan_steps),
            ("acquisition.readiness_attempts", self.acquisition.readiness_attempts),
            ("acquisition.busy_attempts", self.acquisition.busy_attempts),
            (
                "acquisition.shutter_confirm_attempts",
                self.acquisition.shutter_confirm_attempts,
            ),
            ("energy.settle_attempts", self.energy.settle_attempts),
        ];
        for (key, value) in caps {
            if value == 0 {
                return Err(DaqError::Configuration(format!(
                    "{key} must be at least 1"
                )));
            }
        }

        let acq = &self.acquisition;
        if !(acq.readout_per_image_s >= 0.0 && acq.period_margin_s >= 0.0) {
            return Err(DaqError::Configuration(
                "acquisition readout and period margin must be non-negative".into(),
            ));
        }

        let mut seen = HashSet::new();
        for axis in &self.centering.axes {
            if !seen.insert(axis.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "centering axis '{}' is defined twice",
                    axis.name
                )));
            }
            if !axis.bias.is_finite() || axis.bias == 0.0 {
                return Err(DaqError::Configuration(format!(
                    "centering axis '{}' has an unusable bias factor {}",
                    axis.name, axis.bias
                )));
            }
        }

        let energy = &self.energy;
        if let Some(d) = energy.d_spacing {
            if !(d.is_finite() && d > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "energy.d_spacing must be positive, got {d}"
                )));
            }
        }
        if !(energy.threshold_fraction > 0.0 && energy.threshold_fraction <= 1.0) {
            return Err(DaqError::Configuration(format!(
                "energy.threshold_fraction must be in (0, 1], got {}",
                energy.threshold_fraction
            )));
        }
        if !(energy.threshold_settle_s >= 0.0 && energy.threshold_wait_timeout_s >= 0.0) {
            return Err(DaqError::Configuration(
                "energy settle and wait times must be non-negative".into(),
            ));
        }

        Ok(())
    }

    /// Minimal configuration with default timing and no centering axes.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            application: ApplicationConfig {
                name: name.into(),
                log_level: default_log_level(),
                log_format: LogFormat::default(),
            },
            motion: MotionConfig::default(),
            centering: CenteringConfig::default(),
            acquisition: AcquisitionConfig::default(),
            energy: EnergyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_beamline_timing() {
        let config = BeamlineConfig::with_name("MX2");
        assert_eq!(config.motion.poll_interval_ms, 50);
        assert_eq!(config.motion.max_move_tries, 15);
        assert_eq!(config.acquisition.readiness_attempts, 120);
        assert_eq!(config.acquisition.readiness_interval_ms, 500);
        assert!((config.acquisition.readout_per_image_s - 0.0023).abs() < 1e-12);
        assert!(config.energy.d_spacing.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "MX2"
log_level = "debug"

[motion]
max_move_tries = 5

[[centering.axes]]
name = "mono_2nd_xtal"
counter = "counter_int"
bias = -1.0

[[centering.axes]]
name = "slit1_h"
counter = "counter1"
default_distance = 0.5

[energy]
d_spacing = 6.2712
"#
        )
        .unwrap();

        let config = BeamlineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.motion.max_move_tries, 5);
        assert_eq!(config.motion.poll_interval_ms, 50);
        assert_eq!(config.centering.axes.len(), 2);
        assert_eq!(config.centering.axis("mono_2nd_xtal").unwrap().bias, -1.0);
        assert_eq!(config.centering.axis("slit1_h").unwrap().bias, 1.0);
        assert_eq!(config.energy.d_spacing, Some(6.2712));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = BeamlineConfig::with_name("MX2");
        config.acquisition.readiness_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("acquisition.readiness_attempts"));
    }

    #[test]
    fn test_validate_rejects_duplicate_axes() {
        let mut config = BeamlineConfig::with_name("MX2");
        let axis = CenteringAxisConfig {
            name: "slit1_h".into(),
            counter: "counter1".into(),
            bias: 1.0,
            full_path_edge: None,
            default_distance: None,
            default_step: None,
        };
        config.centering.axes = vec![axis.clone(), axis];
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("defined twice")
        ));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = BeamlineConfig::with_name("MX2");
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }
}
