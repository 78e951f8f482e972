//! Mock Hardware Implementations
//!
//! Simulated beamline devices for tests and the command-line demo. All mock
//! devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests can run them on a paused clock.
//!
//! # Available Mocks
//!
//! - `MockAxis` - Motor with soft limits that clamp moves, a busy flag and velocity limits
//! - `MockCounter` - Counter whose reading is a function of an axis position
//! - `MockShutter` - Shutter with a configurable confirmation lag
//! - `MockDetector` - Area detector that saves frames at the configured period
//! - `MockThreshold` - Detector energy threshold
//! - `MockStaging` / `MockRemoteStorage` - Cleanup collaborators
//!
//! Devices sharing a [`CallLog`] record their commands in one sequence so tests
//! can assert cross-device ordering.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{
    AreaDetector, DetectorSettings, ImageStaging, Movable, Readable, RemoteStorage,
    ShutterControl, ThresholdControl,
};
use crate::procedures::lock;

// =============================================================================
// CallLog - Shared command record
// =============================================================================

/// Ordered record of device commands.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Number of entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        lock(&self.entries).iter().filter(|e| *e == entry).count()
    }

    /// Number of entries starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    /// Forget all entries.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

// =============================================================================
// MockAxis - Simulated Motor
// =============================================================================

#[derive(Debug)]
struct AxisState {
    position: f64,
    velocity: f64,
    moving_polls_left: u32,
}

/// Simulated motor axis
///
/// Moves complete instantly but the busy flag stays set for `motion_polls`
/// polls. Targets outside the soft limits are clamped, so an axis pushed
/// against a limit reports an unchanged readback.
///
/// # Example
///
/// ```rust,ignore
/// let axis = MockAxis::new("slit1_h").with_position(10.0).with_limits(0.0, 10.35);
/// axis.move_rel(1.0).await?;
/// assert_eq!(axis.position().await?, 10.35);
/// ```
#[derive(Debug)]
pub struct MockAxis {
    name: String,
    state: Mutex<AxisState>,
    limits: (f64, f64),
    velocity_limits: (f64, f64),
    motion_polls: u32,
    connected: AtomicBool,
    calls: AtomicU32,
    stops: AtomicU32,
    log: CallLog,
}

impl MockAxis {
    /// Create an axis at 0.0 with wide limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(AxisState {
                position: 0.0,
                velocity: 1.0,
                moving_polls_left: 0,
            }),
            limits: (-1000.0, 1000.0),
            velocity_limits: (0.001, 100.0),
            motion_polls: 1,
            connected: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            log: CallLog::new(),
        }
    }

    /// Start at `position`.
    pub fn with_position(self, position: f64) -> Self {
        lock(&self.state).position = position;
        self
    }

    /// Soft limits.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = (min, max);
        self
    }

    /// Initial velocity.
    pub fn with_velocity(self, velocity: f64) -> Self {
        lock(&self.state).velocity = velocity;
        self
    }

    /// Allowed velocity range.
    pub fn with_velocity_limits(mut self, min: f64, max: f64) -> Self {
        self.velocity_limits = (min, max);
        self
    }

    /// Polls for which the busy flag stays set after each move.
    pub fn with_motion_polls(mut self, polls: u32) -> Self {
        self.motion_polls = polls;
        self
    }

    /// Record commands into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Simulate losing or regaining the controller.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Total trait calls, queries included.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `stop()` calls.
    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Position without counting a call.
    pub fn current_position(&self) -> f64 {
        lock(&self.state).position
    }

    /// Velocity without counting a call.
    pub fn current_velocity(&self) -> f64 {
        lock(&self.state).velocity
    }

    /// The log this axis records into.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    fn touch(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("{} is disconnected", self.name))
        }
    }

    fn go_to(&self, target: f64) {
        let mut state = lock(&self.state);
        state.position = target.clamp(self.limits.0, self.limits.1);
        state.moving_polls_left = self.motion_polls;
    }
}

#[async_trait]
impl Movable for MockAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_abs(&self, position: f64) -> Result<()> {
        self.touch()?;
        self.log.record(format!("{}: move_abs {:.4}", self.name, position));
        self.go_to(position);
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        self.touch()?;
        self.log.record(format!("{}: move_rel {:.4}", self.name, distance));
        let target = lock(&self.state).position + distance;
        self.go_to(target);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        self.touch()?;
        Ok(lock(&self.state).position)
    }

    async fn is_moving(&self) -> Result<bool> {
        self.touch()?;
        let mut state = lock(&self.state);
        if state.moving_polls_left > 0 {
            state.moving_polls_left -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn limits(&self) -> Result<(f64, f64)> {
        self.touch()?;
        Ok(self.limits)
    }

    async fn velocity(&self) -> Result<f64> {
        self.touch()?;
        Ok(lock(&self.state).velocity)
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.touch()?;
        let (min, max) = self.velocity_limits;
        if !(min..=max).contains(&velocity) {
            bail!(
                "{}: velocity {} outside [{}, {}]",
                self.name,
                velocity,
                min,
                max
            );
        }
        self.log
            .record(format!("{}: set_velocity {:.4}", self.name, velocity));
        lock(&self.state).velocity = velocity;
        Ok(())
    }

    async fn velocity_limits(&self) -> Result<(f64, f64)> {
        self.touch()?;
        Ok(self.velocity_limits)
    }

    async fn stop(&self) -> Result<()> {
        self.touch()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.record(format!("{}: stop", self.name));
        lock(&self.state).moving_polls_left = 0;
        Ok(())
    }
}

// =============================================================================
// MockCounter - Position-dependent intensity
// =============================================================================

type Profile = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// Counter whose reading follows the position of an axis.
pub struct MockCounter {
    name: String,
    source: Arc<MockAxis>,
    profile: Profile,
    forced: Mutex<Option<f64>>,
    reads: AtomicU32,
}

impl MockCounter {
    /// Counter reading `profile(position)`.
    pub fn new(
        name: impl Into<String>,
        source: Arc<MockAxis>,
        profile: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            profile: Box::new(profile),
            forced: Mutex::new(None),
            reads: AtomicU32::new(0),
        }
    }

    /// Unimodal gaussian peak of height `peak` centred on `center`.
    pub fn gaussian(
        name: impl Into<String>,
        source: Arc<MockAxis>,
        center: f64,
        width: f64,
        peak: f64,
    ) -> Self {
        Self::new(name, source, move |x| {
            peak * (-((x - center) / width).powi(2) / 2.0).exp()
        })
    }

    /// Override every reading with `value` (e.g. NaN for a garbled reply).
    pub fn force_reading(&self, value: Option<f64>) {
        *lock(&self.forced) = value;
    }

    /// Number of reads.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for MockCounter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(value) = *lock(&self.forced) {
            return Ok(value);
        }
        Ok((self.profile)(self.source.current_position()))
    }
}

// =============================================================================
// MockShutter - Simulated Safety Shutter
// =============================================================================

/// Shutter whose confirmed state lags an open command by `open_latency_polls` polls.
#[derive(Debug)]
pub struct MockShutter {
    name: String,
    requested_open: AtomicBool,
    pending_polls: AtomicU32,
    open_latency_polls: u32,
    log: CallLog,
}

impl MockShutter {
    /// Closed shutter that confirms immediately.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requested_open: AtomicBool::new(false),
            pending_polls: AtomicU32::new(0),
            open_latency_polls: 0,
            log: CallLog::new(),
        }
    }

    /// Start open, as left behind by an interrupted run.
    pub fn initially_open(self) -> Self {
        self.requested_open.store(true, Ordering::SeqCst);
        self
    }

    /// Polls reporting closed after an open command.
    pub fn with_open_latency(mut self, polls: u32) -> Self {
        self.open_latency_polls = polls;
        self
    }

    /// Record commands into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Current state without recording a call.
    pub fn is_open_now(&self) -> bool {
        self.requested_open.load(Ordering::SeqCst)
    }

    /// Number of open commands.
    pub fn open_count(&self) -> usize {
        self.log.count(&format!("{}: open", self.name))
    }

    /// Number of close commands.
    pub fn close_count(&self) -> usize {
        self.log.count(&format!("{}: close", self.name))
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_shutter(&self) -> Result<()> {
        self.log.record(format!("{}: open", self.name));
        self.pending_polls
            .store(self.open_latency_polls, Ordering::SeqCst);
        self.requested_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_shutter(&self) -> Result<()> {
        self.log.record(format!("{}: close", self.name));
        self.requested_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        let open = if self.requested_open.load(Ordering::SeqCst) {
            let pending = self.pending_polls.load(Ordering::SeqCst);
            if pending > 0 {
                self.pending_polls.store(pending - 1, Ordering::SeqCst);
                false
            } else {
                true
            }
        } else {
            false
        };
        self.log
            .record(format!("{}: is_open -> {}", self.name, open));
        Ok(open)
    }
}

// =============================================================================
// MockDetector - Simulated Area Detector
// =============================================================================

/// Area detector that saves `num_images` frames, one per acquire period.
pub struct MockDetector {
    name: String,
    connect_after: Option<u32>,
    connection_polls: AtomicU32,
    stale_busy_polls: AtomicU32,
    settings: Mutex<Option<DetectorSettings>>,
    frames: Arc<AtomicU32>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log: CallLog,
}

impl MockDetector {
    /// Detector that is connected and idle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_after: Some(0),
            connection_polls: AtomicU32::new(0),
            stale_busy_polls: AtomicU32::new(0),
            settings: Mutex::new(None),
            frames: Arc::new(AtomicU32::new(0)),
            worker: Mutex::new(None),
            log: CallLog::new(),
        }
    }

    /// Detector whose server never answers.
    pub fn never_ready(name: impl Into<String>) -> Self {
        Self {
            connect_after: None,
            ..Self::new(name)
        }
    }

    /// Report disconnected for the first `polls` connection checks.
    pub fn with_connect_after(mut self, polls: u32) -> Self {
        self.connect_after = Some(polls);
        self
    }

    /// Report a leftover acquisition for the first `polls` busy checks.
    pub fn with_stale_acquisition(self, polls: u32) -> Self {
        self.stale_busy_polls.store(polls, Ordering::SeqCst);
        self
    }

    /// Record commands into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Number of `is_connected()` calls.
    pub fn connection_polls(&self) -> u32 {
        self.connection_polls.load(Ordering::SeqCst)
    }

    /// Last settings written.
    pub fn settings(&self) -> Option<DetectorSettings> {
        lock(&self.settings).clone()
    }

    fn worker_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[async_trait]
impl AreaDetector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_connected(&self) -> Result<bool> {
        let polls = self.connection_polls.fetch_add(1, Ordering::SeqCst) + 1;
        let connected = self.connect_after.is_some_and(|after| polls > after);
        self.log
            .record(format!("{}: is_connected -> {}", self.name, connected));
        Ok(connected)
    }

    async fn reconnect(&self) -> Result<()> {
        self.log.record(format!("{}: reconnect", self.name));
        Ok(())
    }

    async fn is_acquiring(&self) -> Result<bool> {
        let stale = self.stale_busy_polls.load(Ordering::SeqCst);
        if stale > 0 {
            self.stale_busy_polls.store(stale - 1, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(self.worker_running())
    }

    async fn configure(&self, settings: &DetectorSettings) -> Result<()> {
        self.log.record(format!(
            "{}: configure {} images {}",
            self.name, settings.num_images, settings.trigger_mode
        ));
        *lock(&self.settings) = Some(settings.clone());
        Ok(())
    }

    async fn acquire(&self) -> Result<()> {
        self.log.record(format!("{}: acquire", self.name));
        let (images, period) = lock(&self.settings)
            .as_ref()
            .map(|s| (s.num_images, s.acquire_period))
            .unwrap_or((0, 0.0));
        let period = Duration::from_secs_f64(period.max(0.0));
        let frames = self.frames.clone();
        frames.store(0, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            for _ in 0..images {
                sleep(period).await;
                frames.fetch_add(1, Ordering::SeqCst);
            }
        });
        if let Some(previous) = lock(&self.worker).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.log.record(format!("{}: stop", self.name));
        self.stale_busy_polls.store(0, Ordering::SeqCst);
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        Ok(())
    }

    async fn images_saved(&self) -> Result<u32> {
        Ok(self.frames.load(Ordering::SeqCst))
    }
}

// =============================================================================
// MockThreshold - Detector energy threshold
// =============================================================================

/// Threshold that accepts any value and remembers when it was set.
#[derive(Debug)]
pub struct MockThreshold {
    value: Mutex<f64>,
    set_at: Mutex<Vec<(Instant, f64)>>,
    log: CallLog,
}

impl MockThreshold {
    /// Threshold starting at `kev`.
    pub fn new(kev: f64) -> Self {
        Self {
            value: Mutex::new(kev),
            set_at: Mutex::new(Vec::new()),
            log: CallLog::new(),
        }
    }

    /// Record commands into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Every accepted request with the (tokio) time it arrived.
    pub fn requests(&self) -> Vec<(Instant, f64)> {
        lock(&self.set_at).clone()
    }
}

#[async_trait]
impl ThresholdControl for MockThreshold {
    async fn threshold(&self) -> Result<f64> {
        Ok(*lock(&self.value))
    }

    async fn set_threshold(&self, kev: f64) -> Result<()> {
        self.log.record(format!("threshold: set {:.3}", kev));
        lock(&self.set_at).push((Instant::now(), kev));
        *lock(&self.value) = kev;
        Ok(())
    }
}

// =============================================================================
// Cleanup collaborators
// =============================================================================

/// Staging double; `failing()` makes every release fail.
#[derive(Debug, Default)]
pub struct MockStaging {
    fail: bool,
    log: CallLog,
}

impl MockStaging {
    /// Staging that releases successfully.
    pub fn new(log: CallLog) -> Self {
        Self { fail: false, log }
    }

    /// Staging whose release always fails.
    pub fn failing(log: CallLog) -> Self {
        Self { fail: true, log }
    }
}

#[async_trait]
impl ImageStaging for MockStaging {
    async fn release(&self) -> Result<()> {
        self.log.record("staging: release");
        if self.fail {
            bail!("snapshot grabber did not answer");
        }
        Ok(())
    }
}

/// Remote storage double.
#[derive(Debug, Default)]
pub struct MockRemoteStorage {
    log: CallLog,
}

impl MockRemoteStorage {
    /// Storage recording into `log`.
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl RemoteStorage for MockRemoteStorage {
    async fn cleanup(&self, directory: &Path) -> Result<()> {
        self.log
            .record(format!("remote: cleanup {}", directory.display()));
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::TriggerMode;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_axis_clamps_at_limits() {
        let axis = MockAxis::new("slit1_h")
            .with_position(10.0)
            .with_limits(0.0, 10.35);

        axis.move_rel(1.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 10.35);

        axis.move_rel(1.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 10.35);
    }

    #[tokio::test]
    async fn test_axis_busy_for_motion_polls() {
        let axis = MockAxis::new("omega").with_motion_polls(2);
        axis.move_abs(5.0).await.unwrap();
        assert!(axis.is_moving().await.unwrap());
        assert!(axis.is_moving().await.unwrap());
        assert!(!axis.is_moving().await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_axis_errors() {
        let axis = MockAxis::new("slit2_v");
        axis.set_connected(false);
        assert!(axis.position().await.is_err());
        assert_eq!(axis.call_count(), 1);
    }

    #[tokio::test]
    async fn test_counter_follows_axis() {
        let axis = Arc::new(MockAxis::new("slit1_h").with_position(10.5));
        let counter = MockCounter::gaussian("counter1", axis.clone(), 10.5, 0.2, 1000.0);
        assert!((counter.read().await.unwrap() - 1000.0).abs() < 1e-9);

        axis.move_abs(11.0).await.unwrap();
        assert!(counter.read().await.unwrap() < 100.0);

        counter.force_reading(Some(f64::NAN));
        assert!(counter.read().await.unwrap().is_nan());
    }

    #[tokio::test]
    async fn test_shutter_confirmation_lags() {
        let log = CallLog::new();
        let shutter = MockShutter::new("shutter").with_open_latency(2).with_log(log.clone());
        shutter.open_shutter().await.unwrap();
        assert!(!shutter.is_shutter_open().await.unwrap());
        assert!(!shutter.is_shutter_open().await.unwrap());
        assert!(shutter.is_shutter_open().await.unwrap());
        assert_eq!(log.position("shutter: is_open -> true"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_saves_frames() {
        let detector = MockDetector::new("pilatus");
        let settings = DetectorSettings {
            exposure_time: 0.1,
            acquire_period: 0.1023,
            delay_time: 0.0,
            num_images: 5,
            start_angle: 0.0,
            angle_increment: 0.1,
            detector_distance: None,
            wavelength: None,
            beam_position: None,
            trigger_mode: TriggerMode::Internal,
            file_directory: PathBuf::from("/data/test"),
            file_template: "test_1_%05d.cbf".into(),
        };
        detector.configure(&settings).await.unwrap();
        detector.acquire().await.unwrap();
        assert!(detector.is_acquiring().await.unwrap());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(detector.images_saved().await.unwrap(), 5);
        assert!(!detector.is_acquiring().await.unwrap());
    }

    #[tokio::test]
    async fn test_never_ready_detector() {
        let detector = MockDetector::never_ready("pilatus");
        for _ in 0..3 {
            assert!(!detector.is_connected().await.unwrap());
        }
        assert_eq!(detector.connection_polls(), 3);
    }
}
