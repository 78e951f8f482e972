//! Energy and detector threshold coordination.
//!
//! Changing energy moves the monochromator Bragg angle and, when the new
//! energy is far enough from the current detector threshold, requests a
//! threshold change. The two settle on unrelated time scales: the angle axis
//! reports its own busy flag, the threshold has a fixed latency of tens of
//! seconds with no completion feedback.
//!
//! Only one threshold change may be outstanding. A `set_energy` arriving while
//! one is in flight waits for it (up to the configured wait timeout) before
//! issuing anything.
//!
//! # Units
//!
//! Energies are in keV, wavelengths in Å, Bragg angles in degrees.
//! `d_spacing` is the 2d lattice spacing of the monochromator crystal, so
//! `theta = asin(hc / (d_spacing * E))`.

use crate::config::EnergyConfig;
use crate::error::{AppResult, DaqError, DeviceResultExt};
use crate::events::{BeamlineEvent, EventBus};
use crate::hardware::capabilities::{Movable, ThresholdControl};
use crate::procedures::lock;
use crate::procedures::retry::RetryPolicy;
use crate::procedures::task::TaskHandle;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

/// Planck constant times speed of light, keV·Å.
pub const HC_KEV_ANGSTROM: f64 = 12.3984;

const THRESHOLD_DEVICE: &str = "threshold";

/// Photon energy (keV) to wavelength (Å).
pub fn energy_to_wavelength(kev: f64) -> AppResult<f64> {
    if !kev.is_finite() || kev <= 0.0 {
        return Err(DaqError::InvalidTarget(format!(
            "energy must be positive, got {kev} keV"
        )));
    }
    Ok(HC_KEV_ANGSTROM / kev)
}

/// Wavelength (Å) to photon energy (keV).
pub fn wavelength_to_energy(angstrom: f64) -> AppResult<f64> {
    if !angstrom.is_finite() || angstrom <= 0.0 {
        return Err(DaqError::InvalidTarget(format!(
            "wavelength must be positive, got {angstrom} Å"
        )));
    }
    Ok(HC_KEV_ANGSTROM / angstrom)
}

/// Bragg angle (degrees) selecting `kev` on a crystal of spacing `d_spacing`.
///
/// An energy below the crystal cutoff has no Bragg angle and is rejected as
/// `InvalidTarget` rather than wrapped.
pub fn energy_to_theta(kev: f64, d_spacing: f64) -> AppResult<f64> {
    let ratio = HC_KEV_ANGSTROM / (d_spacing * kev);
    if !ratio.is_finite() || !(-1.0..=1.0).contains(&ratio) {
        return Err(DaqError::InvalidTarget(format!(
            "no Bragg angle for {kev} keV with d = {d_spacing} Å (sin θ = {ratio})"
        )));
    }
    Ok(ratio.asin().to_degrees())
}

/// Energy (keV) selected by Bragg angle `theta` (degrees).
pub fn theta_to_energy(theta: f64, d_spacing: f64) -> AppResult<f64> {
    let sin = theta.to_radians().sin();
    if !sin.is_finite() || sin <= 0.0 || d_spacing <= 0.0 {
        return Err(DaqError::InvalidTarget(format!(
            "no energy for θ = {theta}° with d = {d_spacing} Å"
        )));
    }
    Ok(HC_KEV_ANGSTROM / (d_spacing * sin))
}

/// A detector threshold change in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdChangeRequest {
    /// Identifies the request when it is marked settled
    pub id: Uuid,
    /// Energy that caused the change
    pub target_energy: f64,
    /// Threshold requested
    pub threshold: f64,
    /// When the request was sent
    pub issued_at: Instant,
    /// Latency before the detector may be used
    pub expected_settle: Duration,
}

impl ThresholdChangeRequest {
    /// Settle time still to go, zero once elapsed.
    pub fn remaining(&self) -> Duration {
        self.expected_settle.saturating_sub(self.issued_at.elapsed())
    }

    /// Whether the settle latency has elapsed.
    pub fn is_settled(&self) -> bool {
        self.remaining().is_zero()
    }
}

struct EnergyInner {
    config: EnergyConfig,
    d_spacing: f64,
    angle: Arc<dyn Movable>,
    threshold: Arc<dyn ThresholdControl>,
    events: EventBus,
    outstanding: Mutex<Option<ThresholdChangeRequest>>,
}

/// Moves the monochromator and keeps the detector threshold in step.
pub struct EnergyCoordinator {
    inner: Arc<EnergyInner>,
    request_lock: AsyncMutex<()>,
    marker: Mutex<Option<TaskHandle<()>>>,
}

impl EnergyCoordinator {
    /// Requires `energy.d_spacing` to be configured.
    pub fn new(
        config: &EnergyConfig,
        angle: Arc<dyn Movable>,
        threshold: Arc<dyn ThresholdControl>,
        events: EventBus,
    ) -> AppResult<Self> {
        let d_spacing = config.d_spacing.ok_or_else(|| {
            DaqError::Configuration("energy.d_spacing is required for energy changes".into())
        })?;
        if !d_spacing.is_finite() || d_spacing <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "energy.d_spacing must be positive, got {d_spacing}"
            )));
        }
        Ok(Self {
            inner: Arc::new(EnergyInner {
                config: config.clone(),
                d_spacing,
                angle,
                threshold,
                events,
                outstanding: Mutex::new(None),
            }),
            request_lock: AsyncMutex::new(()),
            marker: Mutex::new(None),
        })
    }

    /// Move to `kev`, requesting a threshold change if needed.
    ///
    /// Returns `InvalidTarget` before any command if the energy has no Bragg
    /// angle or the angle is outside the axis limits. With `wait` the call
    /// returns once the angle axis is idle and the threshold has settled;
    /// otherwise a background marker records when the threshold settles.
    pub async fn set_energy(&self, kev: f64, wait: bool) -> AppResult<()> {
        let inner = &self.inner;
        let axis_name = inner.angle.name();
        let theta = energy_to_theta(kev, inner.d_spacing)?;
        let wavelength = energy_to_wavelength(kev)?;
        let (min, max) = inner.angle.limits().await.device(axis_name)?;
        if !(min..=max).contains(&theta) {
            return Err(DaqError::InvalidTarget(format!(
                "{kev} keV needs θ = {theta:.4}° outside {axis_name} limits [{min}, {max}]"
            )));
        }

        let _serial = self.request_lock.lock().await;
        self.await_outstanding().await;

        tracing::info!(energy_kev = kev, theta, wavelength, "Changing energy");
        inner.angle.move_abs(theta).await.device(axis_name)?;

        let target = kev * inner.config.threshold_fraction;
        let current = inner.threshold.threshold().await.device(THRESHOLD_DEVICE)?;
        let request = if (target - current).abs() > inner.config.threshold_tolerance_kev {
            inner
                .threshold
                .set_threshold(target)
                .await
                .device(THRESHOLD_DEVICE)?;
            let request = ThresholdChangeRequest {
                id: Uuid::new_v4(),
                target_energy: kev,
                threshold: target,
                issued_at: Instant::now(),
                expected_settle: inner.config.threshold_settle(),
            };
            tracing::info!(
                threshold_kev = target,
                previous_kev = current,
                settle_s = inner.config.threshold_settle_s,
                "Detector threshold change requested"
            );
            *lock(&inner.outstanding) = Some(request.clone());
            inner.events.emit(BeamlineEvent::ThresholdChangeRequested {
                threshold_kev: target,
                settle_s: inner.config.threshold_settle_s,
            });
            Some(request)
        } else {
            tracing::debug!(threshold_kev = current, "Threshold within tolerance, unchanged");
            None
        };

        inner.events.emit(BeamlineEvent::EnergyChanged {
            energy_kev: kev,
            wavelength,
        });

        if wait {
            inner.settle_policy().wait_idle(inner.angle.as_ref()).await?;
            if let Some(request) = request {
                sleep(request.remaining()).await;
                inner.mark_settled(request.id);
            }
        } else if let Some(request) = request {
            let marker_inner = inner.clone();
            let handle = TaskHandle::spawn("threshold settle marker", move |_| async move {
                sleep(request.remaining()).await;
                marker_inner.mark_settled(request.id);
            });
            // A replaced marker only ever settles its own request.
            *lock(&self.marker) = Some(handle);
        }
        Ok(())
    }

    /// Move to the energy of wavelength `angstrom`.
    pub async fn set_wavelength(&self, angstrom: f64, wait: bool) -> AppResult<()> {
        self.set_energy(wavelength_to_energy(angstrom)?, wait).await
    }

    /// Whether a threshold change is still settling.
    pub fn is_setting_threshold(&self) -> bool {
        lock(&self.inner.outstanding)
            .as_ref()
            .is_some_and(|request| !request.is_settled())
    }

    /// The in-flight threshold change, if any.
    pub fn outstanding_request(&self) -> Option<ThresholdChangeRequest> {
        lock(&self.inner.outstanding).clone()
    }

    /// Angle axis idle and no threshold change settling.
    pub async fn energy_ready(&self) -> AppResult<bool> {
        if self.is_setting_threshold() {
            return Ok(false);
        }
        let moving = self
            .inner
            .angle
            .is_moving()
            .await
            .device(self.inner.angle.name())?;
        Ok(!moving)
    }

    /// Block (bounded) until [`energy_ready`](Self::energy_ready).
    pub async fn wait_settled(&self) -> AppResult<()> {
        self.inner
            .settle_policy()
            .poll_until("energy and threshold to settle", move |_| self.energy_ready())
            .await?;
        let settled = lock(&self.inner.outstanding).as_ref().map(|r| r.id);
        if let Some(id) = settled {
            self.inner.mark_settled(id);
        }
        Ok(())
    }

    /// Energy selected by the current Bragg angle.
    pub async fn current_energy(&self) -> AppResult<f64> {
        let theta = self
            .inner
            .angle
            .position()
            .await
            .device(self.inner.angle.name())?;
        theta_to_energy(theta, self.inner.d_spacing)
    }

    /// Wavelength selected by the current Bragg angle.
    pub async fn current_wavelength(&self) -> AppResult<f64> {
        energy_to_wavelength(self.current_energy().await?)
    }

    /// Reachable energy range `(min, max)` from the angle axis soft limits.
    pub async fn energy_limits(&self) -> AppResult<(f64, f64)> {
        let name = self.inner.angle.name();
        let (low, high) = self.inner.angle.limits().await.device(name)?;
        if low <= 0.0 || high > 90.0 || low >= high {
            return Err(DaqError::Configuration(format!(
                "{name} limits [{low}, {high}] are not a usable Bragg range"
            )));
        }
        let max = theta_to_energy(low, self.inner.d_spacing)?;
        let min = theta_to_energy(high, self.inner.d_spacing)?;
        Ok((min, max))
    }

    async fn await_outstanding(&self) {
        let pending = lock(&self.inner.outstanding).clone();
        let Some(request) = pending else {
            return;
        };
        let remaining = request.remaining();
        if !remaining.is_zero() {
            let cap = self.inner.config.threshold_wait_timeout();
            tracing::info!(
                remaining_s = remaining.as_secs_f64(),
                "Waiting for previous threshold change to settle"
            );
            sleep(remaining.min(cap)).await;
            if remaining > cap {
                tracing::warn!(
                    threshold_kev = request.threshold,
                    "Previous threshold change did not settle within the wait timeout, continuing"
                );
            }
        }
        self.inner.mark_settled(request.id);
    }
}

impl EnergyInner {
    fn settle_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(self.config.settle_attempts, self.config.poll_interval_ms)
    }

    /// Clear the outstanding request if it is still `id`.
    fn mark_settled(&self, id: Uuid) {
        let mut outstanding = lock(&self.outstanding);
        if outstanding.as_ref().is_some_and(|r| r.id == id) {
            if let Some(request) = outstanding.take() {
                tracing::info!(threshold_kev = request.threshold, "Detector threshold settled");
                self.events.emit(BeamlineEvent::ThresholdSettled {
                    threshold_kev: request.threshold,
                });
            }
        }
    }
}
