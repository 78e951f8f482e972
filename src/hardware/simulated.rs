//! A complete simulated beamline built from the mock devices.

use crate::config::BeamlineConfig;
use crate::error::AppResult;
use crate::events::EventBus;
use crate::hardware::mock::{
    CallLog, MockAxis, MockCounter, MockDetector, MockRemoteStorage, MockShutter, MockStaging,
    MockThreshold,
};
use crate::procedures::acquisition::AcquisitionDevices;
use crate::procedures::centering::AxisDevices;
use crate::procedures::energy::{energy_to_theta, EnergyCoordinator};
use std::collections::HashMap;
use std::sync::Arc;

const START_ENERGY_KEV: f64 = 12.0;

/// One centering axis and the counter that follows it.
pub struct SimulatedAxis {
    /// Motor
    pub axis: Arc<MockAxis>,
    /// Counter peaking somewhere near the middle of the sweep
    pub counter: Arc<MockCounter>,
}

/// Mock devices for every role the procedures need, sharing one [`CallLog`].
pub struct SimulatedBeamline {
    /// Commands issued to every device, in order
    pub log: CallLog,
    /// Centering axes by name
    pub centering: HashMap<String, SimulatedAxis>,
    /// Sample rotation
    pub omega: Arc<MockAxis>,
    /// Safety shutter
    pub shutter: Arc<MockShutter>,
    /// Area detector
    pub detector: Arc<MockDetector>,
    /// Monochromator Bragg axis
    pub mono_theta: Arc<MockAxis>,
    /// Detector energy threshold
    pub threshold: Arc<MockThreshold>,
    /// Snapshot staging
    pub staging: Arc<MockStaging>,
    /// Detector server storage
    pub remote_storage: Arc<MockRemoteStorage>,
}

impl SimulatedBeamline {
    /// Build devices for every centering axis in `config`.
    ///
    /// Each counter peaks at a different offset from the axis start, with the
    /// sign of the axis bias so that the biased intensity has a maximum.
    pub fn from_config(config: &BeamlineConfig) -> Self {
        let log = CallLog::new();
        let mut centering = HashMap::new();
        for (index, axis_config) in config.centering.axes.iter().enumerate() {
            let axis = Arc::new(
                MockAxis::new(axis_config.name.as_str())
                    .with_limits(-5.0, 5.0)
                    .with_log(log.clone()),
            );
            let offset = 0.1 * (index as f64 + 1.0);
            let peak = 1.0e4 * axis_config.bias.signum();
            let counter = Arc::new(MockCounter::gaussian(
                axis_config.counter.as_str(),
                axis.clone(),
                offset,
                0.25,
                peak,
            ));
            centering.insert(axis_config.name.clone(), SimulatedAxis { axis, counter });
        }

        let start_theta = config
            .energy
            .d_spacing
            .and_then(|d| energy_to_theta(START_ENERGY_KEV, d).ok())
            .unwrap_or(10.0);

        Self {
            centering,
            omega: Arc::new(
                MockAxis::new("omega")
                    .with_velocity(30.0)
                    .with_velocity_limits(0.001, 60.0)
                    .with_log(log.clone()),
            ),
            shutter: Arc::new(
                MockShutter::new("shutter")
                    .with_open_latency(2)
                    .with_log(log.clone()),
            ),
            detector: Arc::new(MockDetector::new("pilatus").with_log(log.clone())),
            mono_theta: Arc::new(
                MockAxis::new("mono_theta")
                    .with_limits(3.0, 30.0)
                    .with_position(start_theta)
                    .with_motion_polls(4)
                    .with_log(log.clone()),
            ),
            threshold: Arc::new(MockThreshold::new(START_ENERGY_KEV / 2.0).with_log(log.clone())),
            staging: Arc::new(MockStaging::new(log.clone())),
            remote_storage: Arc::new(MockRemoteStorage::new(log.clone())),
            log,
        }
    }

    /// Devices for the centering orchestrator.
    pub fn centering_devices(&self) -> HashMap<String, AxisDevices> {
        self.centering
            .iter()
            .map(|(name, sim)| {
                (
                    name.clone(),
                    AxisDevices {
                        axis: sim.axis.clone(),
                        counter: sim.counter.clone(),
                    },
                )
            })
            .collect()
    }

    /// Devices for the acquisition sequencer.
    pub fn acquisition_devices(&self) -> AcquisitionDevices {
        AcquisitionDevices {
            rotation: self.omega.clone(),
            shutter: self.shutter.clone(),
            detector: self.detector.clone(),
            staging: Some(self.staging.clone()),
            remote_storage: Some(self.remote_storage.clone()),
        }
    }

    /// Energy coordinator on the simulated monochromator.
    pub fn energy_coordinator(
        &self,
        config: &BeamlineConfig,
        events: EventBus,
    ) -> AppResult<EnergyCoordinator> {
        EnergyCoordinator::new(
            &config.energy,
            self.mono_theta.clone(),
            self.threshold.clone(),
            events,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CenteringAxisConfig;
    use crate::hardware::capabilities::{Movable, Readable};

    #[tokio::test]
    async fn test_counters_peak_with_bias_sign() {
        let mut config = BeamlineConfig::with_name("sim");
        config.centering.axes = vec![CenteringAxisConfig {
            name: "mono_2nd_xtal".into(),
            counter: "counter_int".into(),
            bias: -1.0,
            full_path_edge: None,
            default_distance: None,
            default_step: None,
        }];
        let beamline = SimulatedBeamline::from_config(&config);
        let sim = &beamline.centering["mono_2nd_xtal"];
        sim.axis.move_abs(0.1).await.unwrap();

        assert!(sim.counter.read().await.unwrap() < 0.0);
        assert_eq!(beamline.centering_devices().len(), 1);
    }
}
