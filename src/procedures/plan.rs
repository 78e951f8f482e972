//! Acquisition plans.
//!
//! An [`AcquisitionPlan`] describes one rotation collection and derives the
//! quantities the handshake needs: end angle, exposure window and the angular
//! velocity that makes rotation span exactly the exposure window.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::TriggerMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parameters of one rotation collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Rotation angle at the first frame (degrees)
    pub start_angle: f64,
    /// Rotation per frame (degrees)
    pub angle_increment: f64,
    /// Frames to collect
    pub number_of_images: u32,
    /// Exposure per frame (seconds)
    pub exposure_time: f64,
    /// Detector free-runs instead of waiting for per-frame triggers
    pub shutterless: bool,
    /// Must be `Internal` when shutterless, `ExternalTrigger` otherwise
    pub trigger_mode: TriggerMode,
    /// Number of the first frame
    pub first_image_number: u32,
    /// Frames per wedge; `None` collects a single wedge
    pub reference_interval: Option<u32>,
    /// Angular overlap between consecutive wedges (degrees)
    pub overlap: f64,
    /// Move to this energy before collecting
    pub energy_kev: Option<f64>,
    /// Sample to detector distance (mm)
    pub detector_distance: Option<f64>,
    /// Beam centre on the detector (pixels)
    pub beam_position: Option<(f64, f64)>,
    /// Passed to the detector unmodified
    pub file_directory: PathBuf,
    /// Passed to the detector unmodified
    pub file_template: String,
}

/// A contiguous run of frames within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Wedge {
    /// Number of the first frame of the wedge
    pub first_image: u32,
    /// Rotation angle of the first frame
    pub start_angle: f64,
    /// Frames in the wedge
    pub images: u32,
}

impl AcquisitionPlan {
    /// Plan with the trigger mode that matches `shutterless`.
    pub fn new(
        start_angle: f64,
        angle_increment: f64,
        number_of_images: u32,
        exposure_time: f64,
        shutterless: bool,
    ) -> Self {
        Self {
            start_angle,
            angle_increment,
            number_of_images,
            exposure_time,
            shutterless,
            trigger_mode: if shutterless {
                TriggerMode::Internal
            } else {
                TriggerMode::ExternalTrigger
            },
            first_image_number: 1,
            reference_interval: None,
            overlap: 0.0,
            energy_kev: None,
            detector_distance: None,
            beam_position: None,
            file_directory: PathBuf::from("/tmp"),
            file_template: "image_%06d.cbf".to_string(),
        }
    }

    /// Set the output location.
    pub fn with_files(mut self, directory: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        self.file_directory = directory.into();
        self.file_template = template.into();
        self
    }

    /// Change energy before collecting.
    pub fn with_energy(mut self, kev: f64) -> Self {
        self.energy_kev = Some(kev);
        self
    }

    /// Split into wedges of `interval` frames overlapping by `overlap` degrees.
    pub fn with_wedges(mut self, interval: u32, overlap: f64) -> Self {
        self.reference_interval = Some(interval);
        self.overlap = overlap;
        self
    }

    /// Total rotation covered by the collection.
    pub fn angular_range(&self) -> f64 {
        self.angle_increment * f64::from(self.number_of_images)
    }

    /// Rotation angle after the last frame.
    pub fn total_angle(&self) -> f64 {
        self.start_angle + self.angular_range()
    }

    /// Time from first trigger to last readout, in seconds.
    pub fn exposure_window(&self, readout_per_image: f64) -> f64 {
        (self.exposure_time + readout_per_image) * f64::from(self.number_of_images)
    }

    /// Angular velocity that spans the exposure window (degrees/s).
    pub fn required_velocity(&self, readout_per_image: f64) -> f64 {
        self.angular_range() / self.exposure_window(readout_per_image)
    }

    /// Check internal consistency. Touches no device.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::InvalidParameters(msg));
        if self.number_of_images == 0 {
            return invalid("number_of_images must be at least 1".into());
        }
        for (name, value) in [
            ("start_angle", self.start_angle),
            ("angle_increment", self.angle_increment),
            ("exposure_time", self.exposure_time),
            ("overlap", self.overlap),
        ] {
            if !value.is_finite() {
                return invalid(format!("{name} must be finite, got {value}"));
            }
        }
        if self.exposure_time <= 0.0 {
            return invalid(format!(
                "exposure_time must be positive, got {}",
                self.exposure_time
            ));
        }
        if self.angle_increment <= 0.0 {
            return invalid(format!(
                "angle_increment must be positive, got {}",
                self.angle_increment
            ));
        }
        let expected = if self.shutterless {
            TriggerMode::Internal
        } else {
            TriggerMode::ExternalTrigger
        };
        if self.trigger_mode != expected {
            return invalid(format!(
                "trigger mode {} does not match shutterless={}",
                self.trigger_mode, self.shutterless
            ));
        }
        if self.reference_interval == Some(0) {
            return invalid("reference_interval must be at least 1".into());
        }
        if let Some(kev) = self.energy_kev {
            if !kev.is_finite() || kev <= 0.0 {
                return invalid(format!("energy must be positive, got {kev}"));
            }
        }
        Ok(())
    }

    /// Split the collection at every `reference_interval` frames.
    ///
    /// Each wedge starts `images * increment - overlap` after the previous
    /// one; the last wedge holds the remainder.
    pub fn prepare_wedges(&self) -> Vec<Wedge> {
        let interval = self
            .reference_interval
            .filter(|&r| r > 0)
            .unwrap_or(self.number_of_images)
            .max(1);

        let mut wedges = Vec::new();
        let mut remaining = self.number_of_images;
        let mut first_image = self.first_image_number;
        let mut start_angle = self.start_angle;
        while remaining > 0 {
            let images = remaining.min(interval);
            wedges.push(Wedge {
                first_image,
                start_angle,
                images,
            });
            first_image += images;
            start_angle += f64::from(images) * self.angle_increment - self.overlap;
            remaining -= images;
        }
        wedges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_quantities() {
        let plan = AcquisitionPlan::new(10.0, 0.1, 100, 0.1, true);
        assert!((plan.total_angle() - 20.0).abs() < 1e-9);
        assert!((plan.exposure_window(0.0023) - 10.23).abs() < 1e-9);
        assert!((plan.required_velocity(0.0023) - 10.0 / 10.23).abs() < 1e-9);
        assert_eq!(plan.trigger_mode, TriggerMode::Internal);
    }

    #[test]
    fn test_trigger_mode_must_match_shutterless() {
        let mut plan = AcquisitionPlan::new(0.0, 0.1, 10, 0.1, false);
        assert_eq!(plan.trigger_mode, TriggerMode::ExternalTrigger);
        assert!(plan.validate().is_ok());
        plan.trigger_mode = TriggerMode::Internal;
        assert!(matches!(plan.validate(), Err(DaqError::InvalidParameters(_))));
    }

    #[test]
    fn test_rejects_degenerate_plans() {
        assert!(AcquisitionPlan::new(0.0, 0.1, 0, 0.1, true).validate().is_err());
        assert!(AcquisitionPlan::new(0.0, 0.0, 10, 0.1, true).validate().is_err());
        assert!(AcquisitionPlan::new(0.0, 0.1, 10, -1.0, true).validate().is_err());
        assert!(AcquisitionPlan::new(f64::NAN, 0.1, 10, 0.1, true).validate().is_err());
    }

    #[test]
    fn test_wedges_hold_remainder() {
        let plan = AcquisitionPlan::new(0.0, 0.5, 25, 0.1, true).with_wedges(10, 1.0);
        let wedges = plan.prepare_wedges();
        assert_eq!(wedges.len(), 3);
        assert_eq!(wedges[0], Wedge { first_image: 1, start_angle: 0.0, images: 10 });
        assert_eq!(wedges[1].first_image, 11);
        assert!((wedges[1].start_angle - 4.0).abs() < 1e-9);
        assert_eq!(wedges[2].images, 5);
        assert!((wedges[2].start_angle - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_wedge_without_interval() {
        let plan = AcquisitionPlan::new(30.0, 0.1, 7, 0.1, false);
        assert_eq!(
            plan.prepare_wedges(),
            vec![Wedge { first_image: 1, start_angle: 30.0, images: 7 }]
        );
    }
}
