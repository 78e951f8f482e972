//! Beamline procedures.
//!
//! Each procedure sequences capability traits from [`crate::hardware`] and
//! reports progress on the [`EventBus`](crate::events::EventBus).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CenteringOrchestrator   AcquisitionSequencer   EnergyCoordinator      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Scanner   AcquisitionPlan   SafingSequence   BeamLease   TaskHandle    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  RetryPolicy (every hardware wait is bounded)                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Movable | Readable | ShutterControl | AreaDetector | ThresholdControl  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Orchestrators own background tasks and are the only components that hold
//! state across calls. Pre-flight validation always happens before the first
//! device command.

pub mod acquisition;
pub mod centering;
pub mod energy;
pub mod lease;
pub mod plan;
pub mod retry;
pub mod safety;
pub mod scanner;
pub mod state;
pub mod task;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
