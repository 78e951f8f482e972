//! Beam centering.
//!
//! The [`CenteringOrchestrator`] runs the [`Scanner`] over a plan of axes in a
//! single cancellable background task. For every enabled axis it moves to the
//! start of the sweep, scans, and parks the axis at the best position.
//!
//! # Lifecycle
//!
//! - `start()` validates the whole plan before touching any device and rejects
//!   a second run while one is in progress
//! - the task ends with exactly one of `CenteringConcluded`, `CenteringError`
//!   or (via `cancel()`) `CenteringCancelled`
//! - `cancel()` kills the task first and only then stops every axis of the plan
//!
//! Last centred positions are kept per orchestrator instance.

use crate::config::{BeamlineConfig, CenteringAxisConfig};
use crate::error::{AppResult, DaqError, DeviceResultExt};
use crate::events::{BeamlineEvent, EventBus};
use crate::hardware::capabilities::{Movable, Readable};
use crate::procedures::lease::BeamLease;
use crate::procedures::lock;
use crate::procedures::scanner::{ScanRequest, ScanResult, Scanner};
use crate::procedures::task::TaskHandle;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Per-axis entry of a centering plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Configured axis name
    pub axis: String,
    /// Whether this axis is centred
    pub enabled: bool,
    /// Half-width of the sweep around the current position
    pub distance: Option<f64>,
    /// Relative move per scan step
    pub step: Option<f64>,
    /// Sweep from the travel edge until the axis stops
    pub full_path: bool,
}

impl ScanParameters {
    /// Enabled entry sweeping `distance` either side of the current position.
    pub fn sweep(axis: impl Into<String>, step: f64, distance: f64) -> Self {
        Self {
            axis: axis.into(),
            enabled: true,
            distance: Some(distance),
            step: Some(step),
            full_path: false,
        }
    }

    /// Enabled entry sweeping the whole travel range.
    pub fn full_path(axis: impl Into<String>, step: f64) -> Self {
        Self {
            axis: axis.into(),
            enabled: true,
            distance: None,
            step: Some(step),
            full_path: true,
        }
    }

    /// Entry that is validated but not scanned.
    pub fn disabled(axis: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            enabled: false,
            distance: None,
            step: None,
            full_path: false,
        }
    }
}

/// Devices behind one centering axis.
#[derive(Clone)]
pub struct AxisDevices {
    /// The motor being scanned
    pub axis: Arc<dyn Movable>,
    /// The counter sampled at every step
    pub counter: Arc<dyn Readable>,
}

/// Operator-facing defaults for one axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisDefaults {
    /// Axis name
    pub axis: String,
    /// Suggested sweep half-width
    pub distance: Option<f64>,
    /// Suggested step
    pub step: Option<f64>,
}

/// Result for one centred axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisOutcome {
    /// Axis name
    pub axis: String,
    /// What the scan found
    pub scan: ScanResult,
}

/// Where the orchestrator is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CenteringStatus {
    /// Never started
    Idle,
    /// Background task in progress
    Running,
    /// All enabled axes processed
    Concluded,
    /// Aborted by an error
    Failed(String),
    /// Aborted by `cancel()`
    Cancelled,
}

struct CentringAxis {
    devices: AxisDevices,
    config: CenteringAxisConfig,
}

struct CenteringInner {
    axes: HashMap<String, CentringAxis>,
    order: Vec<String>,
    scanner: Scanner,
    events: EventBus,
    status: watch::Sender<CenteringStatus>,
    last_centred: Mutex<HashMap<String, f64>>,
    last_outcomes: Mutex<Vec<AxisOutcome>>,
}

struct RunningCentering {
    handle: TaskHandle<()>,
    axes: Vec<String>,
}

/// Sequences beam-centering scans over the configured axes.
pub struct CenteringOrchestrator {
    inner: Arc<CenteringInner>,
    running: Mutex<Option<RunningCentering>>,
    lease: BeamLease,
}

impl CenteringOrchestrator {
    /// Bind every configured centering axis to its devices.
    ///
    /// Fails with `Configuration` if a configured axis has no devices.
    pub fn new(
        config: &BeamlineConfig,
        mut devices: HashMap<String, AxisDevices>,
        events: EventBus,
        lease: BeamLease,
    ) -> AppResult<Self> {
        let mut axes = HashMap::new();
        let mut order = Vec::new();
        for axis_config in &config.centering.axes {
            let bound = devices.remove(&axis_config.name).ok_or_else(|| {
                DaqError::Configuration(format!(
                    "no devices provided for centering axis '{}'",
                    axis_config.name
                ))
            })?;
            order.push(axis_config.name.clone());
            axes.insert(
                axis_config.name.clone(),
                CentringAxis {
                    devices: bound,
                    config: axis_config.clone(),
                },
            );
        }
        for unused in devices.keys() {
            tracing::warn!(axis = %unused, "devices provided for an axis that is not configured for centering");
        }

        let (status, _) = watch::channel(CenteringStatus::Idle);
        Ok(Self {
            inner: Arc::new(CenteringInner {
                axes,
                order,
                scanner: Scanner::new(&config.motion, events.clone()),
                events,
                status,
                last_centred: Mutex::new(HashMap::new()),
                last_outcomes: Mutex::new(Vec::new()),
            }),
            running: Mutex::new(None),
            lease,
        })
    }

    /// Validate `plan` and launch the centering task.
    ///
    /// Returns `InvalidParameters` without any device access if the plan is
    /// malformed, and `Busy` if centering or another beam owner is active.
    pub fn start(&self, plan: Vec<ScanParameters>) -> AppResult<()> {
        self.validate(&plan)?;

        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(DaqError::Busy("centering is already running".into()));
        }
        let lease = self.lease.try_acquire("centering")?;

        let axes: Vec<String> = plan.iter().map(|p| p.axis.clone()).collect();
        tracing::info!(
            axes = ?axes,
            enabled = plan.iter().filter(|p| p.enabled).count(),
            "Starting beam centering"
        );
        self.inner.status.send_replace(CenteringStatus::Running);
        lock(&self.inner.last_outcomes).clear();

        let inner = self.inner.clone();
        let stop_list = axes.clone();
        let handle = TaskHandle::spawn("beam centering", move |_| async move {
            let _lease = lease;
            match inner.run(&plan).await {
                Ok(()) => {
                    tracing::info!("Beam centering concluded");
                    inner.events.emit(BeamlineEvent::CenteringConcluded);
                    inner.status.send_replace(CenteringStatus::Concluded);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Beam centering failed, stopping axes");
                    inner.stop_axes(&stop_list).await;
                    inner.events.emit(BeamlineEvent::CenteringError {
                        message: e.to_string(),
                    });
                    inner.status.send_replace(CenteringStatus::Failed(e.to_string()));
                }
            }
        });

        *running = Some(RunningCentering { handle, axes });
        Ok(())
    }

    /// Kill the centering task, then stop every axis of its plan.
    ///
    /// Safe in any state. With no run to cancel (never started, or already
    /// cancelled) it does nothing, so repeated calls issue no further stops.
    pub async fn cancel(&self) -> AppResult<()> {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            tracing::debug!("No centering run to cancel");
            return Ok(());
        };

        let completed = running.handle.abort().await.is_some();
        let errors = self.inner.stop_axes(&running.axes).await;
        if !completed {
            tracing::info!("Beam centering cancelled");
            self.inner.events.emit(BeamlineEvent::CenteringCancelled);
            self.inner.status.send_replace(CenteringStatus::Cancelled);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> CenteringStatus {
        self.inner.status.borrow().clone()
    }

    /// Wait until the current run (if any) has ended and return its status.
    pub async fn wait_until_done(&self) -> CenteringStatus {
        let mut rx = self.inner.status.subscribe();
        let result = match rx.wait_for(|s| *s != CenteringStatus::Running).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        result
    }

    /// Positions each axis was last parked at by this orchestrator.
    pub fn last_centred_positions(&self) -> HashMap<String, f64> {
        lock(&self.inner.last_centred).clone()
    }

    /// Per-axis results of the most recent run.
    pub fn last_outcomes(&self) -> Vec<AxisOutcome> {
        lock(&self.inner.last_outcomes).clone()
    }

    /// Configured default distance/step per axis, in configuration order.
    pub fn defaults(&self) -> Vec<AxisDefaults> {
        self.inner
            .order
            .iter()
            .filter_map(|name| self.inner.axes.get(name))
            .map(|a| AxisDefaults {
                axis: a.config.name.clone(),
                distance: a.config.default_distance,
                step: a.config.default_step,
            })
            .collect()
    }

    fn validate(&self, plan: &[ScanParameters]) -> AppResult<()> {
        for p in plan {
            let invalid = |reason: String| {
                Err(DaqError::InvalidParameters(format!("{}: {reason}", p.axis)))
            };
            if !self.inner.axes.contains_key(&p.axis) {
                return invalid("unknown centering axis".into());
            }
            if let Some(step) = p.step {
                if !step.is_finite() || step == 0.0 {
                    return invalid(format!("step must be finite and non-zero, got {step}"));
                }
            }
            if p.enabled && p.step.is_none() {
                return invalid("an enabled axis needs a step".into());
            }
            if let Some(distance) = p.distance {
                if !distance.is_finite() || distance < 0.0 {
                    return invalid(format!(
                        "distance must be finite and non-negative, got {distance}"
                    ));
                }
                if let Some(step) = p.step {
                    if distance > 0.0 && step.abs() > distance {
                        return invalid(format!(
                            "step {} is larger than distance {distance}",
                            step.abs()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl CenteringInner {
    async fn run(&self, plan: &[ScanParameters]) -> AppResult<()> {
        for params in plan.iter().filter(|p| p.enabled) {
            if let Some(outcome) = self.center_axis(params).await? {
                lock(&self.last_outcomes).push(outcome);
            }
        }
        Ok(())
    }

    /// Centre one axis. `None` when the entry asks for no sweep at all.
    async fn center_axis(&self, params: &ScanParameters) -> AppResult<Option<AxisOutcome>> {
        let entry = self.axes.get(&params.axis).ok_or_else(|| {
            DaqError::InvalidParameters(format!("{}: unknown centering axis", params.axis))
        })?;
        let step = params.step.ok_or_else(|| {
            DaqError::InvalidParameters(format!("{}: an enabled axis needs a step", params.axis))
        })?;
        let axis = entry.devices.axis.as_ref();
        let counter = entry.devices.counter.as_ref();
        let name = params.axis.as_str();
        let bias = entry.config.bias;
        let distance = params.distance.unwrap_or(0.0);
        if !params.full_path && distance == 0.0 {
            tracing::info!(axis = %name, "No sweep distance, leaving axis in place");
            return Ok(None);
        }

        let initial = axis.position().await.device(name)?;
        let start = if params.full_path {
            match entry.config.full_path_edge {
                Some(edge) => edge,
                None => {
                    let (min, max) = axis.limits().await.device(name)?;
                    if step > 0.0 {
                        min
                    } else {
                        max
                    }
                }
            }
        } else {
            initial - distance * step.signum()
        };

        tracing::info!(axis = %name, initial, start, step, distance, "Moving to scan start");
        axis.move_abs(start).await.device(name)?;
        self.scanner.settle_with_updates(axis, counter, bias).await?;

        let scan = self
            .scanner
            .scan(
                axis,
                counter,
                &ScanRequest {
                    step,
                    initial_position: initial,
                    max_distance: Some(distance),
                    full_path: params.full_path,
                    bias,
                },
            )
            .await?;

        if scan.hit_physical_limit {
            let position = axis.position().await.device(name)?;
            tracing::warn!(axis = %name, position, "Physical limit reached during centering");
            self.events.emit(BeamlineEvent::LimitReached {
                axis: name.to_string(),
                position,
            });
        }

        if let Some(best) = scan.position_at_max {
            tracing::info!(axis = %name, position = best, intensity = scan.max_intensity, "Moving to maximum");
            axis.move_abs(best).await.device(name)?;
            self.scanner.settle_with_updates(axis, counter, bias).await?;
            lock(&self.last_centred).insert(name.to_string(), best);
            self.events.emit(BeamlineEvent::AxisCentered {
                axis: name.to_string(),
                position: best,
                intensity: scan.max_intensity,
            });
        }

        Ok(Some(AxisOutcome {
            axis: name.to_string(),
            scan,
        }))
    }

    /// Stop every named axis concurrently, logging failures.
    async fn stop_axes(&self, names: &[String]) -> Vec<DaqError> {
        let mut unique: Vec<&String> = Vec::new();
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }

        let stops = unique.into_iter().filter_map(|name| {
            self.axes.get(name).map(|entry| async move {
                entry.devices.axis.stop().await.device(name)
            })
        });

        join_all(stops)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to stop axis");
                    Some(e)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockAxis, MockCounter};

    struct Rig {
        orchestrator: CenteringOrchestrator,
        slit: Arc<MockAxis>,
        mono: Arc<MockAxis>,
        events: EventBus,
        lease: BeamLease,
    }

    fn axis_config(name: &str, counter: &str, bias: f64) -> CenteringAxisConfig {
        CenteringAxisConfig {
            name: name.into(),
            counter: counter.into(),
            bias,
            full_path_edge: None,
            default_distance: Some(0.5),
            default_step: Some(0.05),
        }
    }

    fn rig() -> Rig {
        let mut config = BeamlineConfig::with_name("test");
        config.centering.axes = vec![
            axis_config("mono_2nd_xtal", "counter_int", -1.0),
            axis_config("slit1_h", "counter1", 1.0),
        ];

        let slit = Arc::new(MockAxis::new("slit1_h").with_position(10.0));
        let mono = Arc::new(MockAxis::new("mono_2nd_xtal").with_position(0.0));
        let slit_counter = Arc::new(MockCounter::gaussian("counter1", slit.clone(), 10.5, 0.3, 1e4));
        let mono_counter = Arc::new(MockCounter::gaussian("counter_int", mono.clone(), -0.2, 0.1, -50.0));

        let mut devices = HashMap::new();
        devices.insert(
            "slit1_h".to_string(),
            AxisDevices {
                axis: slit.clone(),
                counter: slit_counter,
            },
        );
        devices.insert(
            "mono_2nd_xtal".to_string(),
            AxisDevices {
                axis: mono.clone(),
                counter: mono_counter,
            },
        );

        let events = EventBus::default();
        let lease = BeamLease::new();
        let orchestrator =
            CenteringOrchestrator::new(&config, devices, events.clone(), lease.clone()).unwrap();
        Rig {
            orchestrator,
            slit,
            mono,
            events,
            lease,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_centres_enabled_axes_in_order() {
        let rig = rig();
        let mut rx = rig.events.subscribe();
        rig.orchestrator
            .start(vec![
                ScanParameters::sweep("mono_2nd_xtal", 0.05, 0.5),
                ScanParameters::disabled("slit1_h"),
            ])
            .unwrap();

        assert_eq!(rig.orchestrator.wait_until_done().await, CenteringStatus::Concluded);
        assert!((rig.mono.current_position() + 0.2).abs() < 0.05);
        assert_eq!(rig.slit.current_position(), 10.0);
        assert!(rig.slit.log().entries().is_empty());

        let centred = rig.orchestrator.last_centred_positions();
        assert!(centred.contains_key("mono_2nd_xtal"));
        assert!(!centred.contains_key("slit1_h"));

        let mut terminal = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.is_terminal() {
                terminal.push(event);
            }
        }
        assert_eq!(terminal, vec![BeamlineEvent::CenteringConcluded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_axis_without_distance_is_left_alone() {
        let rig = rig();
        let mut rx = rig.events.subscribe();
        let mut entry = ScanParameters::disabled("slit1_h");
        entry.enabled = true;
        entry.step = Some(0.1);
        rig.orchestrator
            .start(vec![entry, ScanParameters::sweep("mono_2nd_xtal", 0.05, 0.5)])
            .unwrap();

        assert_eq!(rig.orchestrator.wait_until_done().await, CenteringStatus::Concluded);
        assert_eq!(rig.slit.call_count(), 0);
        assert_eq!(rig.slit.current_position(), 10.0);
        assert!(!rig.orchestrator.last_centred_positions().contains_key("slit1_h"));
        let outcomes = rig.orchestrator.last_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].axis, "mono_2nd_xtal");

        while let Ok(event) = rx.try_recv() {
            if let BeamlineEvent::AxisCentered { axis, .. } = &event {
                assert_ne!(axis, "slit1_h");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_larger_than_distance_rejected_without_motion() {
        let rig = rig();
        let err = rig
            .orchestrator
            .start(vec![ScanParameters::sweep("slit1_h", 0.5, 0.2)])
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidParameters(_)));
        assert_eq!(rig.slit.call_count(), 0);
        assert_eq!(rig.orchestrator.status(), CenteringStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_entry_is_still_validated() {
        let rig = rig();
        let mut entry = ScanParameters::disabled("slit1_h");
        entry.distance = Some(0.1);
        entry.step = Some(0.2);
        let err = rig
            .orchestrator
            .start(vec![ScanParameters::sweep("mono_2nd_xtal", 0.05, 0.5), entry])
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidParameters(_)));
        assert_eq!(rig.mono.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabled_axis_without_step_rejected() {
        let rig = rig();
        let mut entry = ScanParameters::disabled("slit1_h");
        entry.enabled = true;
        entry.distance = Some(1.0);
        assert!(matches!(
            rig.orchestrator.start(vec![entry]),
            Err(DaqError::InvalidParameters(msg)) if msg.contains("needs a step")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_axis_rejected() {
        let rig = rig();
        assert!(matches!(
            rig.orchestrator.start(vec![ScanParameters::sweep("slit9_v", 0.1, 1.0)]),
            Err(DaqError::InvalidParameters(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_kills_task_then_stops_every_axis() {
        let rig = rig();
        let mut rx = rig.events.subscribe();
        rig.orchestrator
            .start(vec![
                ScanParameters::sweep("slit1_h", 0.01, 1.0),
                ScanParameters::disabled("mono_2nd_xtal"),
            ])
            .unwrap();

        // Let the scan get going
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(rig.orchestrator.status(), CenteringStatus::Running);
        let moves_before = rig.slit.log().count_prefix("slit1_h: move");

        rig.orchestrator.cancel().await.unwrap();
        assert_eq!(rig.orchestrator.status(), CenteringStatus::Cancelled);
        assert_eq!(rig.slit.stop_count(), 1);
        assert_eq!(rig.mono.stop_count(), 1);

        // Nothing moves after the stop
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(rig.slit.log().count_prefix("slit1_h: move"), moves_before);
        let entries = rig.slit.log().entries();
        assert_eq!(entries.last().map(String::as_str), Some("slit1_h: stop"));

        let terminal: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(BeamlineEvent::is_terminal)
            .collect();
        assert_eq!(terminal, vec![BeamlineEvent::CenteringCancelled]);
        assert!(rig.lease.holder().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let rig = rig();
        rig.orchestrator.cancel().await.unwrap();
        rig.orchestrator.cancel().await.unwrap();
        assert_eq!(rig.slit.stop_count(), 0);

        rig.orchestrator
            .start(vec![ScanParameters::sweep("slit1_h", 0.1, 0.5)])
            .unwrap();
        rig.orchestrator.cancel().await.unwrap();
        rig.orchestrator.cancel().await.unwrap();
        assert_eq!(rig.slit.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_running_is_busy() {
        let rig = rig();
        rig.orchestrator
            .start(vec![ScanParameters::sweep("slit1_h", 0.01, 1.0)])
            .unwrap();
        assert!(matches!(
            rig.orchestrator
                .start(vec![ScanParameters::sweep("slit1_h", 0.01, 1.0)]),
            Err(DaqError::Busy(_))
        ));
        rig.orchestrator.cancel().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_reading_fails_and_stops_axes() {
        let mut config = BeamlineConfig::with_name("test");
        config.centering.axes = vec![axis_config("slit1_h", "counter1", 1.0)];
        let slit = Arc::new(MockAxis::new("slit1_h"));
        let counter = Arc::new(MockCounter::gaussian("counter1", slit.clone(), 0.0, 1.0, 1.0));
        counter.force_reading(Some(f64::INFINITY));
        let mut devices = HashMap::new();
        devices.insert(
            "slit1_h".to_string(),
            AxisDevices {
                axis: slit.clone(),
                counter,
            },
        );
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orchestrator =
            CenteringOrchestrator::new(&config, devices, events, BeamLease::new()).unwrap();

        orchestrator
            .start(vec![ScanParameters::sweep("slit1_h", 0.1, 1.0)])
            .unwrap();
        let status = orchestrator.wait_until_done().await;
        assert!(matches!(status, CenteringStatus::Failed(ref msg) if msg.contains("counter1")));
        assert_eq!(slit.stop_count(), 1);

        let terminal: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(BeamlineEvent::is_terminal)
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], BeamlineEvent::CenteringError { .. }));
    }

    #[test]
    fn test_missing_devices_is_configuration_error() {
        let mut config = BeamlineConfig::with_name("test");
        config.centering.axes = vec![axis_config("slit1_h", "counter1", 1.0)];
        let result =
            CenteringOrchestrator::new(&config, HashMap::new(), EventBus::default(), BeamLease::new());
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_defaults_follow_configuration_order() {
        let rig = rig();
        let defaults = rig.orchestrator.defaults();
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults[0].axis, "mono_2nd_xtal");
        assert_eq!(defaults[1].step, Some(0.05));
    }
}
