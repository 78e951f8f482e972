//! Progress and result notifications.
//!
//! Procedures publish [`BeamlineEvent`]s on an [`EventBus`] for UIs, plots and
//! loggers. Publishing never blocks and never fails: with no subscribers the
//! event is dropped, and a slow subscriber only lags its own receiver.

use crate::procedures::state::AcquisitionState;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Notification emitted by a procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BeamlineEvent {
    /// Live readback of an axis.
    PositionChanged { axis: String, position: f64 },
    /// Live counter value, bias already applied.
    IntensityChanged { counter: String, intensity: f64 },
    /// A scan of `axis` begins; plots for it should be cleared.
    ScanStarted { axis: String },
    /// One sampled point of a scan.
    ScanPoint {
        axis: String,
        position: f64,
        intensity: f64,
    },
    /// The axis refused to move further during a scan.
    LimitReached { axis: String, position: f64 },
    /// An axis was moved to the position of maximum intensity.
    AxisCentered {
        axis: String,
        position: f64,
        intensity: f64,
    },
    /// All enabled axes were processed.
    CenteringConcluded,
    /// Centering aborted with an error; axes were stopped.
    CenteringError { message: String },
    /// Centering was cancelled by the operator.
    CenteringCancelled,
    /// The safety shutter changed state.
    ShutterStateChanged { open: bool },
    /// The acquisition state machine moved.
    AcquisitionStateChanged { state: AcquisitionState },
    /// A data collection began.
    CollectionStarted { id: Uuid, images: u32 },
    /// The detector saved a frame.
    CollectionImageTaken { id: Uuid, frame: u32 },
    /// A data collection completed.
    CollectionFinished { id: Uuid },
    /// A data collection aborted with an error; hardware was safed.
    CollectionFailed { id: Uuid, message: String },
    /// A data collection was stopped on request; hardware was safed.
    CollectionStopped { id: Uuid },
    /// The monochromator was commanded to a new energy.
    EnergyChanged { energy_kev: f64, wavelength: f64 },
    /// A detector threshold change was issued.
    ThresholdChangeRequested { threshold_kev: f64, settle_s: f64 },
    /// The detector threshold finished settling.
    ThresholdSettled { threshold_kev: f64 },
}

impl BeamlineEvent {
    /// Whether this event ends a centering or collection operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BeamlineEvent::CenteringConcluded
                | BeamlineEvent::CenteringError { .. }
                | BeamlineEvent::CenteringCancelled
                | BeamlineEvent::CollectionFinished { .. }
                | BeamlineEvent::CollectionFailed { .. }
                | BeamlineEvent::CollectionStopped { .. }
        )
    }
}

/// Fan-out channel for [`BeamlineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BeamlineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Advisory only.
    pub fn emit(&self, event: BeamlineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BeamlineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(BeamlineEvent::CenteringConcluded);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(BeamlineEvent::ScanStarted { axis: "slit1_h".into() });
        bus.emit(BeamlineEvent::CenteringConcluded);

        assert_eq!(
            rx.recv().await.unwrap(),
            BeamlineEvent::ScanStarted { axis: "slit1_h".into() }
        );
        assert!(rx.recv().await.unwrap().is_terminal());
    }

    #[test]
    fn test_serializes_with_tag() {
        let json = serde_json::to_value(BeamlineEvent::ShutterStateChanged { open: true }).unwrap();
        assert_eq!(json["event"], "shutter_state_changed");
        assert_eq!(json["open"], true);
    }
}
