//! Data model and persistence for far-field antenna measurements.
//!
//! Networks, result sets and calibrations live here together with their
//! file formats, so drivers and experiment code can share them without
//! depending on each other.

pub mod calibration;
pub mod gain_file;
pub mod mdif;
pub mod network;
pub mod range_arg;
pub mod result_set;
pub mod settings;
