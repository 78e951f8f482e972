//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits that beamline devices implement. Procedures
//! depend only on the capabilities they drive:
//!
//! - A slit blade or goniometer axis implements `Movable`
//! - An ionisation chamber or diode implements `Readable`
//! - The safety shutter implements `ShutterControl`
//! - A photon-counting area detector implements `AreaDetector + ThresholdControl`
//!
//! Optional collaborators (`ImageStaging`, `RemoteStorage`) are passed as
//! `Option<Arc<dyn _>>` and checked once at construction, never queried per call.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capability: Motion Control
///
/// Devices that can move to positions (slit blades, crystal pitch, omega).
///
/// # Contract
/// - `move_abs()` and `move_rel()` initiate motion and return immediately
/// - `is_moving()` reports the busy flag; callers poll it to wait for settle
/// - Moves beyond the soft limits stop at the limit, the readback does not pass it
/// - Velocities are in device units per second
#[async_trait]
pub trait Movable: Send + Sync {
    /// Logical axis name used in logs and notifications.
    fn name(&self) -> &str;

    /// Move to absolute position
    ///
    /// # Arguments
    /// * `position` - Target position in device-native units
    ///
    /// # Returns
    /// - Ok(()) if motion initiated successfully
    /// - Err if the device rejected the command or is disconnected
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    ///
    /// # Arguments
    /// * `distance` - Distance to move (positive or negative)
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current readback position
    ///
    /// May be approximate if device is currently moving.
    async fn position(&self) -> Result<f64>;

    /// Whether the axis is still executing a move.
    async fn is_moving(&self) -> Result<bool>;

    /// Soft limits as `(min, max)`.
    async fn limits(&self) -> Result<(f64, f64)>;

    /// Current velocity.
    async fn velocity(&self) -> Result<f64>;

    /// Set the velocity used by subsequent moves.
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Allowed velocity range as `(min, max)`.
    async fn velocity_limits(&self) -> Result<(f64, f64)>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Scalar Readout
///
/// Counters, ionisation chambers and diodes sampled synchronously with motion.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Logical counter name.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn read(&self) -> Result<f64>;
}

/// Capability: Shutter Control
///
/// # Contract
/// - `open_shutter()` / `close_shutter()` issue the command and return
/// - `is_shutter_open()` reports the confirmed physical state, which may lag
///   the command
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Logical shutter name.
    fn name(&self) -> &str;

    /// Command the shutter open.
    async fn open_shutter(&self) -> Result<()>;

    /// Command the shutter closed.
    async fn close_shutter(&self) -> Result<()>;

    /// Confirmed shutter state.
    async fn is_shutter_open(&self) -> Result<bool>;
}

/// How the area detector starts each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running frames timed by the detector (shutterless collection).
    Internal,
    /// One frame per external trigger pulse.
    ExternalTrigger,
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerMode::Internal => write!(f, "Internal"),
            TriggerMode::ExternalTrigger => write!(f, "Ext. Trigger"),
        }
    }
}

/// Everything written to the detector before a collection.
///
/// File directory and template are forwarded to the detector unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Exposure per frame in seconds
    pub exposure_time: f64,
    /// Frame period in seconds
    pub acquire_period: f64,
    /// Delay before the first frame in seconds
    pub delay_time: f64,
    /// Frames to acquire
    pub num_images: u32,
    /// Rotation angle of the first frame (header only)
    pub start_angle: f64,
    /// Rotation per frame (header only)
    pub angle_increment: f64,
    /// Sample-to-detector distance in mm, when known
    pub detector_distance: Option<f64>,
    /// Beam wavelength in Å, when known
    pub wavelength: Option<f64>,
    /// Beam centre on the detector in pixels
    pub beam_position: Option<(f64, f64)>,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Directory the detector writes into
    pub file_directory: PathBuf,
    /// File name template
    pub file_template: String,
}

/// Capability: Frame-based Area Detector
///
/// # Contract
/// - `is_connected()` reports whether the vendor acquisition server answers
/// - `reconnect()` asks the server to come back; success is not guaranteed
/// - `acquire()` arms the detector to accept triggers (or start free-running)
/// - `images_saved()` counts frames written since the last `acquire()`
#[async_trait]
pub trait AreaDetector: Send + Sync {
    /// Logical detector name.
    fn name(&self) -> &str;

    /// Whether the acquisition server is reachable.
    async fn is_connected(&self) -> Result<bool>;

    /// Try to (re)start the acquisition server.
    async fn reconnect(&self) -> Result<()>;

    /// Whether an acquisition is in progress.
    async fn is_acquiring(&self) -> Result<bool>;

    /// Write collection settings.
    async fn configure(&self, settings: &DetectorSettings) -> Result<()>;

    /// Start acquiring.
    async fn acquire(&self) -> Result<()>;

    /// Stop acquiring.
    async fn stop(&self) -> Result<()>;

    /// Frames saved since the last `acquire()`.
    async fn images_saved(&self) -> Result<u32>;
}

/// Capability: Energy Threshold
///
/// Setting the threshold returns once the command is accepted; the detector
/// needs a long, roughly fixed time afterwards before it is usable.
#[async_trait]
pub trait ThresholdControl: Send + Sync {
    /// Current threshold in keV.
    async fn threshold(&self) -> Result<f64>;

    /// Request a new threshold in keV.
    async fn set_threshold(&self, kev: f64) -> Result<()>;
}

/// Capability: Image Staging
///
/// Resources held while frames are in flight (snapshot grabbers, transfer buffers).
#[async_trait]
pub trait ImageStaging: Send + Sync {
    /// Release everything held for the current collection.
    async fn release(&self) -> Result<()>;
}

/// Capability: Remote Temporary Storage
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Remove temporary files written for `directory`.
    async fn cleanup(&self, directory: &Path) -> Result<()>;
}
