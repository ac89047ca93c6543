//! Instrument drivers for far-field antenna measurements.
//!
//! - [`positioner`]: two-axis motor stages (serial stepper turntable and a
//!   simulated stage) behind one [`positioner::Positioner`] trait, plus the
//!   model registry used to connect them by name.
//! - [`analyzer`]: the network analyzer interface and a simulated analyzer.
//! - [`serial`]: byte-stream transport shared by serial drivers, with a
//!   scripted mock for tests.

pub mod analyzer;
pub mod positioner;
pub mod serial;
