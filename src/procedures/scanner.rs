//! Bounded intensity-maximizing scan.
//!
//! Steps one axis through a sweep while sampling a counter and keeps the
//! position of the highest (bias-corrected) reading. The sweep ends when the
//! axis reaches `initial_position + max_distance` in the direction of travel,
//! or when the axis stops responding to relative moves, which is how a hard
//! limit switch shows up.
//!
//! ```text
//!   sample ─┬─> move_rel(step) ─> wait readback change (<= max_move_tries)
//!           │         ^                         │
//!           │         └──── not at distance ────┤
//!           │                                   v
//!           └──────────────────── unchanged readback / distance reached ─> ScanResult
//! ```

use crate::config::MotionConfig;
use crate::error::{AppResult, DaqError, DeviceResultExt};
use crate::events::{BeamlineEvent, EventBus};
use crate::hardware::capabilities::{Movable, Readable};
use crate::procedures::retry::RetryPolicy;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;

/// One scan invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRequest {
    /// Relative move per step; its sign sets the direction of travel
    pub step: f64,
    /// Reference position the distance limit is measured from
    pub initial_position: f64,
    /// Distance from `initial_position` after which the sweep stops
    pub max_distance: Option<f64>,
    /// Sweep until the axis stops moving, ignoring `max_distance`
    pub full_path: bool,
    /// Factor applied to every counter reading before comparison
    pub bias: f64,
}

/// Outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanResult {
    /// Highest bias-corrected reading
    pub max_intensity: f64,
    /// Where that reading was taken
    pub position_at_max: Option<f64>,
    /// The axis refused to move before the distance limit was reached.
    /// Always false for full-path scans, where the edge is the expected end.
    pub hit_physical_limit: bool,
    /// Relative moves commanded
    pub steps: u32,
}

/// Runs scans with the configured polling bounds.
#[derive(Debug, Clone)]
pub struct Scanner {
    poll_interval: Duration,
    max_move_tries: u32,
    max_steps: u32,
    settle: RetryPolicy,
    events: EventBus,
}

impl Scanner {
    /// Build a scanner from the motion configuration.
    pub fn new(config: &MotionConfig, events: EventBus) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_move_tries: config.max_move_tries,
            max_steps: config.max_scan_steps,
            settle: RetryPolicy::new(config.settle_attempts, config.poll_interval()),
            events,
        }
    }

    /// Scan `axis` while sampling `counter`.
    ///
    /// The axis must be idle. Device failures are returned as-is and never
    /// retried; an unusable (non-finite) reading is a device failure too.
    pub async fn scan(
        &self,
        axis: &dyn Movable,
        counter: &dyn Readable,
        request: &ScanRequest,
    ) -> AppResult<ScanResult> {
        let step = request.step;
        if step == 0.0 || !step.is_finite() {
            return Err(DaqError::InvalidParameters(format!(
                "scan step for {} must be finite and non-zero, got {step}",
                axis.name()
            )));
        }
        let name = axis.name();
        let direction = step.signum();
        let eps = step.abs() * 1e-6;

        self.events.emit(BeamlineEvent::ScanStarted {
            axis: name.to_string(),
        });

        let mut position = axis.position().await.device(name)?;
        let intensity = self.sample(counter, request.bias).await?;
        self.publish(name, counter.name(), position, intensity);
        let mut max_intensity = intensity;
        let mut position_at_max = Some(position);

        let limit = if request.full_path {
            None
        } else {
            match request.max_distance {
                Some(d) if d > 0.0 => Some(request.initial_position + d * direction),
                _ => {
                    tracing::debug!(axis = %name, "no sweep distance, initial sample only");
                    return Ok(ScanResult {
                        max_intensity,
                        position_at_max,
                        hit_physical_limit: false,
                        steps: 0,
                    });
                }
            }
        };

        tracing::info!(
            axis = %name,
            step,
            from = position,
            limit = ?limit,
            full_path = request.full_path,
            "Starting scan"
        );

        let mut steps = 0;
        let mut stuck = false;
        loop {
            if steps >= self.max_steps {
                return Err(DaqError::Timeout {
                    what: format!("scan of {name} to reach its travel edge"),
                    attempts: self.max_steps,
                });
            }

            axis.move_rel(step).await.device(name)?;
            steps += 1;
            let new_position = self.await_readback_change(axis, position).await?;
            stuck = new_position == position;

            let intensity = self.sample(counter, request.bias).await?;
            self.publish(name, counter.name(), new_position, intensity);
            if intensity > max_intensity {
                max_intensity = intensity;
                position_at_max = Some(new_position);
            }
            position = new_position;

            if stuck {
                tracing::warn!(axis = %name, position, "Axis stopped responding, limit reached");
                break;
            }
            if let Some(limit) = limit {
                if (position - limit) * direction >= -eps {
                    break;
                }
            }
        }

        let result = ScanResult {
            max_intensity,
            position_at_max,
            hit_physical_limit: stuck && !request.full_path,
            steps,
        };
        tracing::info!(
            axis = %name,
            steps,
            max_intensity,
            position_at_max = ?result.position_at_max,
            hit_physical_limit = result.hit_physical_limit,
            "Scan finished"
        );
        Ok(result)
    }

    /// Wait for the axis to settle, emitting live readback while it moves.
    pub async fn settle_with_updates(
        &self,
        axis: &dyn Movable,
        counter: &dyn Readable,
        bias: f64,
    ) -> AppResult<f64> {
        let name = axis.name();
        sleep(self.poll_interval).await;
        self.settle
            .poll_until(&format!("axis {name} to stop"), move |_| async move {
                let moving = axis.is_moving().await.device(name)?;
                if moving {
                    let position = axis.position().await.device(name)?;
                    let intensity = self.sample(counter, bias).await?;
                    self.live(name, counter.name(), position, intensity);
                }
                Ok(!moving)
            })
            .await?;

        let position = axis.position().await.device(name)?;
        let intensity = self.sample(counter, bias).await?;
        self.live(name, counter.name(), position, intensity);
        Ok(position)
    }

    /// Poll up to `max_move_tries` times for the readback to leave `previous`.
    async fn await_readback_change(&self, axis: &dyn Movable, previous: f64) -> AppResult<f64> {
        let name = axis.name();
        let mut current = previous;
        for _ in 0..self.max_move_tries {
            sleep(self.poll_interval).await;
            self.settle.wait_idle(axis).await?;
            current = axis.position().await.device(name)?;
            if current != previous {
                break;
            }
        }
        Ok(current)
    }

    async fn sample(&self, counter: &dyn Readable, bias: f64) -> AppResult<f64> {
        let raw = counter.read().await.device(counter.name())?;
        if !raw.is_finite() {
            return Err(DaqError::device(
                counter.name(),
                format!("unusable reading {raw}"),
            ));
        }
        Ok(raw * bias)
    }

    fn live(&self, axis: &str, counter: &str, position: f64, intensity: f64) {
        self.events.emit(BeamlineEvent::PositionChanged {
            axis: axis.to_string(),
            position,
        });
        self.events.emit(BeamlineEvent::IntensityChanged {
            counter: counter.to_string(),
            intensity,
        });
    }

    fn publish(&self, axis: &str, counter: &str, position: f64, intensity: f64) {
        self.live(axis, counter, position, intensity);
        self.events.emit(BeamlineEvent::ScanPoint {
            axis: axis.to_string(),
            position,
            intensity,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockAxis, MockCounter};
    use std::sync::Arc;

    fn scanner() -> (Scanner, EventBus) {
        let events = EventBus::default();
        (Scanner::new(&MotionConfig::default(), events.clone()), events)
    }

    fn request(step: f64, initial: f64, distance: Option<f64>, full_path: bool) -> ScanRequest {
        ScanRequest {
            step,
            initial_position: initial,
            max_distance: distance,
            full_path,
            bias: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finds_peak_within_distance() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit1_h").with_position(10.0));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 10.5, 0.3, 1e4);

        let result = scanner
            .scan(axis.as_ref(), &counter, &request(0.1, 10.0, Some(1.0), false))
            .await
            .unwrap();

        assert_eq!(result.steps, 10);
        assert!((result.position_at_max.unwrap() - 10.5).abs() < 0.1);
        assert!(!result.hit_physical_limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_distance_samples_only() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit1_h").with_position(2.0));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 0.0, 1.0, 1.0);

        for distance in [None, Some(0.0)] {
            let result = scanner
                .scan(axis.as_ref(), &counter, &request(0.1, 2.0, distance, false))
                .await
                .unwrap();
            assert_eq!(result.steps, 0);
            assert_eq!(result.position_at_max, Some(2.0));
        }
        assert!(axis.log().entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_switch_is_reported() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(
            MockAxis::new("slit1_h")
                .with_position(10.0)
                .with_limits(0.0, 10.35),
        );
        let counter = MockCounter::gaussian("counter1", axis.clone(), 10.5, 0.3, 1e4);

        let result = scanner
            .scan(axis.as_ref(), &counter, &request(0.1, 10.0, Some(1.0), false))
            .await
            .unwrap();

        assert!(result.hit_physical_limit);
        assert!((result.position_at_max.unwrap() - 10.35).abs() < 1e-9);
        // 10.1, 10.2, 10.3, 10.35, then a move that goes nowhere
        assert_eq!(result.steps, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_path_edge_is_not_a_limit() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit1_h").with_position(-1.0).with_limits(-1.0, 1.0));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 0.3, 0.2, 50.0);

        let result = scanner
            .scan(axis.as_ref(), &counter, &request(0.25, -1.0, None, true))
            .await
            .unwrap();

        assert!(!result.hit_physical_limit);
        assert!((result.position_at_max.unwrap() - 0.25).abs() < 1e-9);
        assert_eq!(axis.current_position(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_bias_finds_minimum() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("mono_2nd_xtal").with_position(-0.5));
        // Inverted chamber: the beam shows up as the most negative reading
        let counter = MockCounter::gaussian("counter_int", axis.clone(), 0.2, 0.1, -300.0);

        let mut req = request(0.1, -0.5, Some(1.0), false);
        req.bias = -1.0;
        let result = scanner.scan(axis.as_ref(), &counter, &req).await.unwrap();

        assert!((result.position_at_max.unwrap() - 0.2).abs() < 0.1);
        assert!(result.max_intensity > 250.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_step_scans_downwards() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit2_v").with_position(5.0));
        let counter = MockCounter::gaussian("counter2", axis.clone(), 4.6, 0.1, 10.0);

        let result = scanner
            .scan(axis.as_ref(), &counter, &request(-0.2, 5.0, Some(1.0), false))
            .await
            .unwrap();

        assert_eq!(result.steps, 5);
        assert!((axis.current_position() - 4.0).abs() < 1e-9);
        assert!((result.position_at_max.unwrap() - 4.6).abs() < 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_reading_is_device_error() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit1_h"));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 0.0, 1.0, 1.0);
        counter.force_reading(Some(f64::NAN));

        let err = scanner
            .scan(axis.as_ref(), &counter, &request(0.1, 0.0, Some(1.0), false))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Device { ref device, .. } if device == "counter1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_axis_propagates() {
        let (scanner, _events) = scanner();
        let axis = Arc::new(MockAxis::new("slit1_h"));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 0.0, 1.0, 1.0);
        axis.set_connected(false);

        let err = scanner
            .scan(axis.as_ref(), &counter, &request(0.1, 0.0, Some(1.0), false))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Device { ref device, .. } if device == "slit1_h"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_point_per_sample() {
        let (scanner, events) = scanner();
        let mut rx = events.subscribe();
        let axis = Arc::new(MockAxis::new("slit1_h"));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 0.0, 1.0, 1.0);

        scanner
            .scan(axis.as_ref(), &counter, &request(0.5, 0.0, Some(1.0), false))
            .await
            .unwrap();

        let mut points = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BeamlineEvent::ScanPoint { .. }) {
                points += 1;
            }
        }
        // initial sample + 2 steps
        assert_eq!(points, 3);
    }
}
