//! Shutter-synchronised rotation collection.
//!
//! The [`AcquisitionSequencer`] drives the shutter/rotation/detector handshake:
//!
//! 1. close a shutter left open, settle the energy if the plan asks for one
//! 2. poll detector readiness (self-healing reconnect, bounded), wait out or
//!    force-stop a leftover acquisition
//! 3. configure the detector, park the rotation at the start angle and set the
//!    angular velocity that spans the exposure window
//! 4. open the shutter and wait for confirmation; only then start rotation and
//!    detector together
//! 5. a close timer armed at shutter-open closes the shutter after the window,
//!    restores the rotation velocity and returns to the collection's start
//!    angle
//!
//! The collection body runs in its own task. [`AcquisitionSequencer::stop_collect`]
//! aborts that task before running the safing sequence, and a failure inside
//! the body runs the same sequence before `CollectionFailed` is emitted. Safing
//! runs in a detached task: dropping the caller's future does not cut it short,
//! and `collect` only returns once it has finished.
//!
//! The close timer and `stop_collect` may both try to close the shutter. The
//! shutter session is behind an async mutex and is consumed by whichever gets
//! it first; the other finds no session and does nothing.

use crate::config::{AcquisitionConfig, BeamlineConfig};
use crate::error::{AppResult, DaqError, DeviceResultExt};
use crate::events::{BeamlineEvent, EventBus};
use crate::hardware::capabilities::{
    AreaDetector, DetectorSettings, ImageStaging, Movable, RemoteStorage, ShutterControl,
};
use crate::procedures::energy::EnergyCoordinator;
use crate::procedures::lease::{BeamLease, LeaseGuard};
use crate::procedures::lock;
use crate::procedures::plan::{AcquisitionPlan, Wedge};
use crate::procedures::retry::RetryPolicy;
use crate::procedures::safety::SafingSequence;
use crate::procedures::state::AcquisitionState;
use crate::procedures::task::TaskHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const STAGING_DEVICE: &str = "image staging";
const REMOTE_DEVICE: &str = "remote storage";

/// Devices taking part in a collection.
#[derive(Clone)]
pub struct AcquisitionDevices {
    /// Sample rotation axis (omega)
    pub rotation: Arc<dyn Movable>,
    /// Safety shutter
    pub shutter: Arc<dyn ShutterControl>,
    /// Area detector
    pub detector: Arc<dyn AreaDetector>,
    /// Snapshot grabber to release on stop, if installed
    pub staging: Option<Arc<dyn ImageStaging>>,
    /// Detector server temporary storage, if installed
    pub remote_storage: Option<Arc<dyn RemoteStorage>>,
}

/// Summary of a completed collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionReport {
    /// Collection identifier used in events
    pub id: Uuid,
    /// Frames saved by the detector
    pub frames: u32,
    /// Wedges collected, in order
    pub wedges: Vec<Wedge>,
    /// When the collection was accepted
    pub started_at: DateTime<Utc>,
    /// When the last wedge closed
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ShutterSession {
    shutter_open: bool,
    /// Velocity and angle to return the rotation to
    restore: Option<(f64, f64)>,
}

struct ActiveCollection {
    id: Uuid,
    directory: PathBuf,
    _lease: LeaseGuard,
}

struct SequencerInner {
    config: AcquisitionConfig,
    motion: RetryPolicy,
    poll_interval: Duration,
    devices: AcquisitionDevices,
    energy: Option<Arc<EnergyCoordinator>>,
    events: EventBus,
    state: watch::Sender<AcquisitionState>,
    session: AsyncMutex<Option<ShutterSession>>,
    close_timer: Mutex<Option<TaskHandle<AppResult<()>>>>,
    body: Mutex<Option<JoinHandle<()>>>,
    /// Set while a collection is in flight and not yet claimed by a stop,
    /// a failure or a normal finish.
    stop_armed: AtomicBool,
    /// True while a safing task owns the hardware.
    safing: watch::Sender<bool>,
    active: Mutex<Option<ActiveCollection>>,
}

/// Runs rotation collections on one rotation axis, shutter and detector.
pub struct AcquisitionSequencer {
    inner: Arc<SequencerInner>,
    lease: BeamLease,
}

impl AcquisitionSequencer {
    /// Create a sequencer. `energy` is required only for plans with an energy.
    pub fn new(
        config: &BeamlineConfig,
        devices: AcquisitionDevices,
        energy: Option<Arc<EnergyCoordinator>>,
        events: EventBus,
        lease: BeamLease,
    ) -> Self {
        let (state, _) = watch::channel(AcquisitionState::Idle);
        let (safing, _) = watch::channel(false);
        Self {
            inner: Arc::new(SequencerInner {
                config: config.acquisition.clone(),
                motion: RetryPolicy::new(config.motion.settle_attempts, config.motion.poll_interval()),
                poll_interval: config.motion.poll_interval(),
                devices,
                energy,
                events,
                state,
                session: AsyncMutex::new(None),
                close_timer: Mutex::new(None),
                body: Mutex::new(None),
                stop_armed: AtomicBool::new(false),
                safing,
                active: Mutex::new(None),
            }),
            lease,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> AcquisitionState {
        *self.inner.state.borrow()
    }

    /// Watch handshake state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.inner.state.subscribe()
    }

    /// Run a collection to completion.
    ///
    /// The plan and the required rotation velocity are checked before any
    /// command is sent. Returns `Cancelled` if [`stop_collect`](Self::stop_collect)
    /// ended the run.
    pub async fn collect(&self, plan: AcquisitionPlan) -> AppResult<CollectionReport> {
        plan.validate()?;
        let inner = &self.inner;
        let rotation = inner.devices.rotation.as_ref();
        let velocity = plan.required_velocity(inner.config.readout_per_image_s);
        let (min, max) = rotation.velocity_limits().await.device(rotation.name())?;
        if !velocity.is_finite() || !(min..=max).contains(&velocity) {
            return Err(DaqError::InvalidParameters(format!(
                "rotation velocity {velocity:.4} deg/s is outside {} limits [{min}, {max}]",
                rotation.name()
            )));
        }
        if plan.energy_kev.is_some() && inner.energy.is_none() {
            return Err(DaqError::Configuration(
                "plan requests an energy change but no energy coordinator is installed".into(),
            ));
        }

        let lease = self.lease.try_acquire("data collection")?;
        let id = Uuid::new_v4();
        let wedges = plan.prepare_wedges();
        let started_at = Utc::now();
        *lock(&inner.active) = Some(ActiveCollection {
            id,
            directory: plan.file_directory.clone(),
            _lease: lease,
        });
        inner.stop_armed.store(true, Ordering::SeqCst);
        tracing::info!(
            %id,
            images = plan.number_of_images,
            wedges = wedges.len(),
            start_angle = plan.start_angle,
            velocity,
            "Starting data collection"
        );
        inner.events.emit(BeamlineEvent::CollectionStarted {
            id,
            images: plan.number_of_images,
        });

        let (tx, rx) = oneshot::channel();
        let body_inner = inner.clone();
        let body_wedges = wedges.clone();
        let handle = tokio::spawn(async move {
            let result = body_inner.run(&plan, &body_wedges, id, velocity).await;
            let _ = tx.send(result);
        });
        *lock(&inner.body) = Some(handle);

        match rx.await {
            Ok(Ok(frames)) => {
                if !inner.claim(false) {
                    inner.wait_safed().await;
                    return Err(DaqError::Cancelled);
                }
                lock(&inner.body).take();
                inner.release_active();
                tracing::info!(%id, frames, "Data collection finished");
                inner.events.emit(BeamlineEvent::CollectionFinished { id });
                Ok(CollectionReport {
                    id,
                    frames,
                    wedges,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Ok(Err(e)) => {
                if inner.claim(true) {
                    tracing::error!(%id, error = %e, "Data collection failed, safing hardware");
                    let safing = inner.spawn_safing(Ending::Failed(e.to_string()));
                    if let Some(Err(incomplete)) = safing.join().await {
                        tracing::error!(%id, error = %incomplete, "Safing after failure was incomplete");
                    }
                } else {
                    inner.wait_safed().await;
                }
                Err(e)
            }
            Err(_) => {
                inner.wait_safed().await;
                Err(DaqError::Cancelled)
            }
        }
    }

    /// Stop the running collection and safe the hardware.
    ///
    /// Sends no commands when nothing is running. A stop already in progress
    /// is waited for, not repeated. The safing keeps running if this future
    /// is dropped.
    pub async fn stop_collect(&self) -> AppResult<()> {
        let inner = &self.inner;
        if !inner.claim(true) {
            tracing::debug!("No collection to stop");
            inner.wait_safed().await;
            return Ok(());
        }
        tracing::info!("Stopping data collection");
        inner
            .spawn_safing(Ending::Stopped)
            .join()
            .await
            .unwrap_or_else(|| Err(DaqError::Cancelled))
    }
}

/// Why a collection is being safed.
enum Ending {
    Stopped,
    Failed(String),
}

impl SequencerInner {
    fn set_state(&self, next: AcquisitionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::debug!(from = %previous, to = %next, "Unusual acquisition state change");
        }
        self.events
            .emit(BeamlineEvent::AcquisitionStateChanged { state: next });
    }

    fn enter_aborting(&self) {
        if self.state.borrow().can_abort() {
            self.set_state(AcquisitionState::Aborting);
        }
    }

    /// Drop the active collection (and its lease), returning its id.
    fn release_active(&self) -> Option<Uuid> {
        lock(&self.active).take().map(|active| active.id)
    }

    /// Claim the in-flight collection. Exactly one of finish, failure and stop
    /// wins. With `safe`, the safing flag is raised in the same step so a
    /// loser waiting on it cannot miss it.
    fn claim(&self, safe: bool) -> bool {
        let mut claimed = false;
        self.safing.send_if_modified(|busy| {
            claimed = self.stop_armed.swap(false, Ordering::SeqCst);
            if claimed && safe {
                *busy = true;
            }
            claimed && safe
        });
        claimed
    }

    /// Abort the body, safe the hardware and release the collection.
    ///
    /// The caller must have won [`claim`](Self::claim) with `safe`.
    fn spawn_safing(self: &Arc<Self>, ending: Ending) -> TaskHandle<AppResult<()>> {
        self.enter_aborting();
        let inner = self.clone();
        TaskHandle::spawn("collection safing", move |_| async move {
            let body = lock(&inner.body).take();
            if let Some(body) = body {
                body.abort();
                let _ = body.await;
            }

            let result = inner.safe_hardware().await;
            let id = inner.release_active();
            inner.set_state(AcquisitionState::Idle);
            if let Some(id) = id {
                inner.events.emit(match ending {
                    Ending::Stopped => BeamlineEvent::CollectionStopped { id },
                    Ending::Failed(message) => BeamlineEvent::CollectionFailed { id, message },
                });
            }
            inner.safing.send_replace(false);
            result
        })
    }

    /// Wait for a running safing task to finish.
    async fn wait_safed(&self) {
        let mut safing = self.safing.subscribe();
        let _ = safing.wait_for(|busy| !*busy).await;
    }

    async fn run(
        self: &Arc<Self>,
        plan: &AcquisitionPlan,
        wedges: &[Wedge],
        id: Uuid,
        velocity: f64,
    ) -> AppResult<u32> {
        self.close_stray_shutter().await?;

        if let Some(kev) = plan.energy_kev {
            let energy = self.energy.as_ref().ok_or_else(|| {
                DaqError::Configuration("no energy coordinator installed".into())
            })?;
            energy.set_energy(kev, false).await?;
        }
        // An earlier fire-and-forget threshold change must settle too.
        if let Some(energy) = &self.energy {
            energy.wait_settled().await?;
        }

        self.wait_detector_ready().await?;
        self.wait_detector_idle().await?;

        let wavelength = match &self.energy {
            Some(energy) => Some(energy.current_wavelength().await?),
            None => None,
        };

        let mut frames = 0;
        for (index, wedge) in wedges.iter().enumerate() {
            tracing::info!(
                %id,
                wedge = index + 1,
                first_image = wedge.first_image,
                images = wedge.images,
                start_angle = wedge.start_angle,
                "Collecting wedge"
            );
            let settings = DetectorSettings {
                exposure_time: plan.exposure_time,
                acquire_period: plan.exposure_time + self.config.period_margin_s,
                delay_time: 0.0,
                num_images: wedge.images,
                start_angle: wedge.start_angle,
                angle_increment: plan.angle_increment,
                detector_distance: plan.detector_distance,
                wavelength,
                beam_position: plan.beam_position,
                trigger_mode: plan.trigger_mode,
                file_directory: plan.file_directory.clone(),
                file_template: plan.file_template.clone(),
            };
            let detector = self.devices.detector.as_ref();
            detector
                .configure(&settings)
                .await
                .device(detector.name())?;

            frames += self.expose_wedge(plan, wedge, id, frames, velocity).await?;
        }

        self.set_state(AcquisitionState::Idle);
        Ok(frames)
    }

    async fn close_stray_shutter(&self) -> AppResult<()> {
        let shutter = self.devices.shutter.as_ref();
        if shutter.is_shutter_open().await.device(shutter.name())? {
            tracing::warn!(shutter = shutter.name(), "Shutter found open, closing before collection");
            shutter.close_shutter().await.device(shutter.name())?;
            self.events
                .emit(BeamlineEvent::ShutterStateChanged { open: false });
        }
        Ok(())
    }

    async fn wait_detector_ready(&self) -> AppResult<()> {
        let detector = self.devices.detector.as_ref();
        let name = detector.name();
        let policy =
            RetryPolicy::from_millis(self.config.readiness_attempts, self.config.readiness_interval_ms);
        let result = policy
            .poll_until("detector server connection", move |attempt| async move {
                let connected = detector.is_connected().await.device(name)?;
                if !connected && attempt == 1 {
                    tracing::warn!(detector = name, "Detector not connected, reconnecting");
                    if let Err(e) = detector.reconnect().await {
                        tracing::warn!(detector = name, error = %e, "Reconnect request failed");
                    }
                }
                Ok(connected)
            })
            .await;

        match result {
            Ok(attempt) => {
                tracing::debug!(detector = name, attempt, "Detector ready");
                Ok(())
            }
            Err(DaqError::Timeout { attempts, .. }) => {
                tracing::error!(detector = name, attempts, "Detector unreachable");
                Err(DaqError::DetectorUnavailable(format!(
                    "{name} not connected after {attempts} attempts"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait out a leftover acquisition, forcing a stop if it does not end.
    async fn wait_detector_idle(&self) -> AppResult<()> {
        let detector = self.devices.detector.as_ref();
        let name = detector.name();
        let policy = RetryPolicy::from_millis(self.config.busy_attempts, self.config.busy_interval_ms);
        let result = policy
            .poll_until("previous acquisition to end", move |_| async move {
                Ok(!detector.is_acquiring().await.device(name)?)
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(DaqError::Timeout { attempts, .. }) => {
                tracing::warn!(detector = name, attempts, "Detector still busy, forcing stop");
                if let Err(e) = self.force_stop().await {
                    tracing::error!(detector = name, error = %e, "Forced stop incomplete, continuing");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn expose_wedge(
        self: &Arc<Self>,
        plan: &AcquisitionPlan,
        wedge: &Wedge,
        id: Uuid,
        frames_before: u32,
        velocity: f64,
    ) -> AppResult<u32> {
        let rotation = self.devices.rotation.as_ref();
        let rname = rotation.name();
        let shutter = self.devices.shutter.as_ref();
        let end_angle = wedge.start_angle + plan.angle_increment * f64::from(wedge.images);
        let window = (plan.exposure_time + self.config.readout_per_image_s) * f64::from(wedge.images);

        let previous_velocity = rotation.velocity().await.device(rname)?;
        *self.session.lock().await = Some(ShutterSession {
            shutter_open: false,
            restore: Some((previous_velocity, plan.start_angle)),
        });

        rotation.move_abs(wedge.start_angle).await.device(rname)?;
        self.motion.wait_idle(rotation).await?;
        rotation.set_velocity(velocity).await.device(rname)?;

        self.set_state(AcquisitionState::ShutterOpening);
        if let Some(session) = self.session.lock().await.as_mut() {
            // Marked before the command so an abort mid-open still closes.
            session.shutter_open = true;
        }
        shutter.open_shutter().await.device(shutter.name())?;
        let confirm = RetryPolicy::from_millis(
            self.config.shutter_confirm_attempts,
            self.config.shutter_confirm_interval_ms,
        );
        confirm
            .poll_until("shutter to open", move |_| async move {
                shutter.is_shutter_open().await.device(shutter.name())
            })
            .await?;
        self.events
            .emit(BeamlineEvent::ShutterStateChanged { open: true });
        self.arm_close_timer(Duration::from_secs_f64(window));

        self.set_state(AcquisitionState::Exposing);
        let detector = self.devices.detector.as_ref();
        tokio::try_join!(
            async { detector.acquire().await.device(detector.name()) },
            async { rotation.move_abs(end_angle).await.device(rname) },
        )?;

        let frames = self.follow_frames(id, frames_before, wedge.images).await?;

        let timer = lock(&self.close_timer).take();
        if let Some(timer) = timer {
            match timer.join().await {
                Some(result) => result?,
                None => {
                    return Err(DaqError::device(
                        shutter.name(),
                        "shutter close timer ended without closing",
                    ))
                }
            }
        }
        self.set_state(AcquisitionState::Idle);
        Ok(frames)
    }

    fn arm_close_timer(self: &Arc<Self>, window: Duration) {
        let inner = self.clone();
        let handle = TaskHandle::spawn("shutter close timer", move |mut cancel| async move {
            tokio::select! {
                _ = sleep(window) => {
                    tracing::info!(window_s = window.as_secs_f64(), "Exposure window elapsed, closing shutter");
                    inner.close_session(true).await
                }
                _ = cancel.cancelled() => Ok(()),
            }
        });
        *lock(&self.close_timer) = Some(handle);
    }

    /// Follow the detector frame counter, emitting one event per frame.
    async fn follow_frames(&self, id: Uuid, offset: u32, images: u32) -> AppResult<u32> {
        let detector = self.devices.detector.as_ref();
        let poll_ms = self.poll_interval.as_millis().max(1);
        let stall_limit = u32::try_from(u128::from(self.config.trigger_timeout_ms) / poll_ms)
            .unwrap_or(u32::MAX)
            .max(1);

        let mut seen = 0;
        let mut stalled = 0;
        while seen < images {
            sleep(self.poll_interval).await;
            let saved = detector
                .images_saved()
                .await
                .device(detector.name())?
                .min(images);
            if saved > seen {
                for frame in seen + 1..=saved {
                    self.events.emit(BeamlineEvent::CollectionImageTaken {
                        id,
                        frame: offset + frame,
                    });
                }
                seen = saved;
                stalled = 0;
            } else {
                stalled += 1;
                if stalled >= stall_limit {
                    return Err(DaqError::Timeout {
                        what: format!("{} to save frame {}", detector.name(), offset + seen + 1),
                        attempts: stall_limit,
                    });
                }
            }
        }
        Ok(seen)
    }

    /// Close the shutter if this session opened it, then restore the rotation.
    ///
    /// Consumes the session; a second call finds none and does nothing.
    async fn close_session(&self, restore: bool) -> AppResult<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };

        if session.shutter_open {
            if *self.state.borrow() == AcquisitionState::Exposing {
                self.set_state(AcquisitionState::ShutterClosing);
            }
            let shutter = self.devices.shutter.as_ref();
            shutter.close_shutter().await.device(shutter.name())?;
            session.shutter_open = false;
            self.events
                .emit(BeamlineEvent::ShutterStateChanged { open: false });
        }

        if restore {
            if let Some((velocity, angle)) = session.restore.take() {
                let rotation = self.devices.rotation.as_ref();
                let rname = rotation.name();
                if rotation.is_moving().await.device(rname)? {
                    if let Err(e) = rotation.stop().await {
                        tracing::warn!(axis = rname, error = %e, "Could not stop rotation before restore");
                    }
                }
                tracing::info!(axis = rname, velocity, angle, "Restoring rotation");
                rotation.set_velocity(velocity).await.device(rname)?;
                rotation.move_abs(angle).await.device(rname)?;
            }
        }

        *guard = None;
        Ok(())
    }

    /// Stop, restart and stop again; a bare stop is sometimes ignored.
    async fn force_stop(&self) -> AppResult<()> {
        let detector = self.devices.detector.as_ref();
        let name = detector.name();
        let delay = Duration::from_millis(self.config.force_stop_delay_ms);
        let mut first_error = None;

        for (command, restart) in [("stop", false), ("restart", true), ("stop", false)] {
            let result = if restart {
                detector.acquire().await
            } else {
                detector.stop().await
            };
            if let Err(e) = result {
                tracing::error!(detector = name, command, error = %e, "Force-stop command failed");
                first_error.get_or_insert(DaqError::device(name, format!("{e:#}")));
            }
            sleep(delay).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bring shutter, rotation, detector and storage to a safe state.
    async fn safe_hardware(&self) -> AppResult<()> {
        let directory = lock(&self.active)
            .as_ref()
            .map(|active| active.directory.clone());

        let mut safing = SafingSequence::new("collection safing");
        safing.add("close shutter and restore rotation", async {
            let timer = lock(&self.close_timer).take();
            if let Some(timer) = timer {
                if let Some(Err(e)) = timer.cancel().await {
                    tracing::warn!(error = %e, "Shutter close timer had failed");
                }
            }
            self.close_session(true).await
        });
        safing.add("force stop detector", self.force_stop());
        if let Some(staging) = self.devices.staging.clone() {
            safing.add("release image staging", async move {
                staging.release().await.device(STAGING_DEVICE)
            });
        }
        if let (Some(remote), Some(directory)) = (self.devices.remote_storage.clone(), directory) {
            let grace = Duration::from_millis(self.config.staging_grace_ms);
            safing.add("clean remote storage", async move {
                sleep(grace).await;
                remote.cleanup(&directory).await.device(REMOTE_DEVICE)
            });
        }
        safing.run().await
    }
}
