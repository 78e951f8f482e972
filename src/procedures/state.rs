//! Acquisition state machine.

use serde::{Deserialize, Serialize};

/// Shutter/rotation/detector handshake state.
///
/// # State Machine
///
/// ```text
/// Idle ──open──> ShutterOpening ──confirmed──> Exposing ──window elapsed──> ShutterClosing ──> Idle
///                      │                           │                              │
///                      └───────────────────────────┴──────────── stop/error ──────┴──> Aborting ──> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// No shutter session open
    Idle,
    /// Shutter commanded open, waiting for confirmation
    ShutterOpening,
    /// Shutter open, rotation and detector running
    Exposing,
    /// Shutter closing and rotation being restored
    ShutterClosing,
    /// Safing after a stop request or a failure
    Aborting,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::ShutterOpening => write!(f, "ShutterOpening"),
            AcquisitionState::Exposing => write!(f, "Exposing"),
            AcquisitionState::ShutterClosing => write!(f, "ShutterClosing"),
            AcquisitionState::Aborting => write!(f, "Aborting"),
        }
    }
}

impl AcquisitionState {
    /// Whether a shutter session is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, AcquisitionState::Idle)
    }

    /// Check if the state allows aborting.
    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            AcquisitionState::ShutterOpening
                | AcquisitionState::Exposing
                | AcquisitionState::ShutterClosing
        )
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: AcquisitionState) -> bool {
        use AcquisitionState::*;
        match (self, next) {
            (Idle, ShutterOpening) => true,
            (ShutterOpening, Exposing) => true,
            (Exposing, ShutterClosing) => true,
            (ShutterClosing, Idle) => true,
            (from, Aborting) => from.can_abort(),
            (Aborting, Idle) => true,
            _ => false,
        }
    }
}
