//! Beamline hardware abstraction.
//!
//! Procedures only see devices through the capability traits in
//! [`capabilities`]. [`mock`] provides in-process doubles for tests, and
//! [`simulated`] wires them into a complete beamline for the command-line tool.

pub mod capabilities;
pub mod mock;
pub mod simulated;
