//! # MX DAQ Core Library
//!
//! Sequencing layer for a macromolecular crystallography beamline. The
//! library drives motors, counters, a safety shutter and an area detector
//! through capability traits and implements the multi-step procedures built
//! on them.
//!
//! ## Crate Structure
//!
//! - **`config`**: `BeamlineConfig`, loaded from TOML and `MX_DAQ_` environment
//!   variables with figment.
//! - **`error`**: the `DaqError` enum shared by every procedure.
//! - **`events`**: `BeamlineEvent` notifications and the broadcast `EventBus`.
//! - **`hardware`**: capability traits, mock devices and a simulated beamline.
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`procedures`**: the intensity-maximising scanner, the centering
//!   orchestrator, the acquisition sequencer and the energy/threshold
//!   coordinator, plus the bounded-retry, task, safing and lease helpers they
//!   share.

pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod procedures;
