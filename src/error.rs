//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for every procedure in the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! report what went wrong while sequencing beamline hardware.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameters`**: pre-flight validation failure. Raised before any device
//!   command is issued, so it never leaves partial motion behind.
//! - **`Device`**: a read or write to a device failed or produced an unusable value.
//!   Propagated immediately and never retried.
//! - **`Timeout`**: a bounded wait exhausted its attempt cap.
//! - **`DetectorUnavailable`**: the area detector stayed unreachable after the
//!   self-healing attempt.
//! - **`InvalidTarget`**: a numerically undefined request, such as an energy outside
//!   the monochromator's Bragg range.
//! - **`Configuration`** / **`Config`**: semantic and parse errors in the beamline
//!   configuration.
//! - **`Busy`**: the requested resource is already owned by another operation.
//!
//! A physical limit reached during a scan is *not* an error; it is reported as data
//! in [`ScanResult`](crate::procedures::scanner::ScanResult).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Device '{device}' error: {message}")]
    Device { device: String, message: String },

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Safing failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Build a device error from any displayable cause.
    pub fn device(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DaqError::Device {
            device: device.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error came out of the pre-flight checks and therefore
    /// caused no hardware side effects.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidParameters(_)
                | DaqError::InvalidTarget(_)
                | DaqError::Busy(_)
                | DaqError::Configuration(_)
        )
    }
}

/// Attach the device name to a capability-layer `anyhow` failure.
pub trait DeviceResultExt<T> {
    /// Convert into [`DaqError::Device`] for `device`.
    fn device(self, device: &str) -> AppResult<T>;
}

impl<T> DeviceResultExt<T> for anyhow::Result<T> {
    fn device(self, device: &str) -> AppResult<T> {
        self.map_err(|e| DaqError::device(device, format!("{e:#}")))
    }
}
