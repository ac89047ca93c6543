//! Far-field measurement orchestration.
//!
//! Ties a [`hardware::positioner::Positioner`] and a
//! [`hardware::analyzer::Analyzer`] together into a scan, and hosts the
//! `farfield` operator tool.

pub mod experiment;
