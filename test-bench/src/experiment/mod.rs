//! Far-field pattern acquisition
//!
//! Walks a positioner over a (theta, phi) grid and reads the configured
//! polarizations from a network analyzer at every point.
//!
//! # Overview
//!
//! For each theta (outer axis) and then each phi (inner axis):
//! 1. Move the positioner and wait for its jog to complete
//! 2. Read each polarization's S-parameter trace in order
//! 3. Tag the trace with its pose and polarization and append it to the results
//! 4. Report progress and a time-remaining estimate
//!
//! # Modules
//!
//! - [`config`] - Grid and polarization settings
//! - [`events`] - Progress events and sinks
//! - [`executor`] - The acquisition loop
//! - [`runner`] - Background thread wrapper with cancel and abort

pub mod config;
pub mod events;
pub mod executor;
pub mod runner;

pub use config::{ExperimentConfig, Polarization};
pub use events::{EventSink, ExperimentEvent, FinishReason};
pub use executor::{
    estimate_remaining, CancelToken, ExperimentError, ExperimentExecutor, ExperimentOutcome,
};
pub use runner::{ExperimentHandle, ExperimentRunner};
