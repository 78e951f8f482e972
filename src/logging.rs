//! Log output.
//!
//! Procedures log through `tracing` with structured fields (`axis`, `device`,
//! `collection`, `request`). This module installs the global subscriber.
//!
//! The configured `[application].log_level` applies to this crate's targets;
//! everything else logs at `warn`. Setting `RUST_LOG` replaces the whole
//! directive.
//!
//! # Example
//! ```no_run
//! use mx_daq::{config::BeamlineConfig, logging};
//! use tracing::warn;
//!
//! let config = BeamlineConfig::load()?;
//! logging::init_from_config(&config)?;
//! warn!(axis = "slit1_h", "Physical limit reached");
//! # Ok::<(), mx_daq::error::DaqError>(())
//! ```

use crate::config::BeamlineConfig;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Log record layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (interactive use)
    Pretty,
    /// One line per record, no colour (beamline consoles)
    #[default]
    Compact,
    /// One JSON object per record (log shipping)
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Most verbose level recorded for this crate
    pub level: LevelFilter,
    /// Record layout
    pub format: LogFormat,
    /// Attach file and line to every record
    pub source_location: bool,
    /// Colour output; only honoured by [`LogFormat::Pretty`]
    pub ansi: bool,
}

impl LogSettings {
    /// Settings at `level` with the default layout.
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            format: LogFormat::default(),
            source_location: false,
            ansi: true,
        }
    }

    /// Settings from `[application]`.
    pub fn from_config(config: &BeamlineConfig) -> AppResult<Self> {
        let raw = &config.application.log_level;
        let level = raw.parse::<LevelFilter>().map_err(|_| {
            DaqError::Configuration(format!("Invalid log_level '{raw}'"))
        })?;
        Ok(Self::new(level).with_format(config.application.log_format))
    }

    /// Set the record layout.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Attach file and line to every record.
    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    /// Enable or disable colour.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn directive(&self) -> String {
        format!("warn,{}={}", env!("CARGO_CRATE_NAME"), self.level)
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let located = self.source_location;
        match self.format {
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_ansi(self.ansi)
                .with_file(located)
                .with_line_number(located)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(false)
                .with_file(located)
                .with_line_number(located)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .flatten_event(true)
                .with_file(located)
                .with_line_number(located)
                .boxed(),
        }
    }
}

/// Install the subscriber described by `[application]`.
pub fn init_from_config(config: &BeamlineConfig) -> AppResult<()> {
    init(&LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber already installed by a test harness or host application is
/// kept, and this returns `Ok(())`.
pub fn init(settings: &LogSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.directive()));

    let result = tracing_subscriber::registry()
        .with(settings.layer().with_filter(filter))
        .try_init();

    match result {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to install log subscriber: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_beamline_config() {
        let mut config = BeamlineConfig::with_name("MX2");
        config.application.log_level = "debug".into();
        config.application.log_format = LogFormat::Json;

        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, LevelFilter::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.directive(), "warn,mx_daq=debug");
    }

    #[test]
    fn test_rejects_unknown_level() {
        let mut config = BeamlineConfig::with_name("MX2");
        config.application.log_level = "loud".into();
        assert!(matches!(
            LogSettings::from_config(&config),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_format_names_in_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: LogFormat,
        }
        let parsed: Wrapper = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(parsed.format, LogFormat::Json);
        assert!(toml::from_str::<Wrapper>("format = \"xml\"").is_err());
    }

    // `test_init_is_idempotent` lives in tests/logging_test.rs: it installs the
    // process-global subscriber, which would clash with `#[traced_test]`.
}
