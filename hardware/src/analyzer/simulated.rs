//! Analyzer that synthesizes traces from a simple antenna model.
//!
//! The transmission magnitude follows a Gaussian main lobe around
//! boresight, so scans over a simulated positioner produce plausible
//! patterns. Reflection terms are a flat -20 dB. Phase is a fixed
//! electrical delay.

use std::f64::consts::PI;

use ndarray::Array1;
use num_complex::Complex64;
use shared::network::{Frequency, Network};
use tracing::debug;

use super::{all_port_pairs, Analyzer, AnalyzerError, AnalyzerResult};
use crate::positioner::SimulatedPose;

/// Electrical delay of the simulated path.
const PATH_DELAY_S: f64 = 2.0e-9;

/// Simulated two-port analyzer.
#[derive(Debug, Clone)]
pub struct SimulatedAnalyzer {
    frequency: Frequency,
    nports: usize,
    peak_gain_db: f64,
    beamwidth_deg: f64,
    pose: Option<SimulatedPose>,
    fail_after: Option<usize>,
    reads: usize,
}

impl SimulatedAnalyzer {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            nports: 2,
            peak_gain_db: -30.0,
            beamwidth_deg: 30.0,
            pose: None,
            fail_after: None,
            reads: 0,
        }
    }

    /// Shape readings by the pose of a simulated positioner.
    pub fn with_pose(mut self, pose: SimulatedPose) -> Self {
        self.pose = Some(pose);
        self
    }

    /// Boresight transmission level in dB.
    pub fn with_peak_gain_db(mut self, gain_db: f64) -> Self {
        self.peak_gain_db = gain_db;
        self
    }

    /// Fail every read after the first `reads` succeed.
    pub fn with_fail_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    pub fn frequency(&self) -> &Frequency {
        &self.frequency
    }

    /// Number of successful reads so far.
    pub fn read_count(&self) -> usize {
        self.reads
    }

    fn transmission_db(&self, a: usize, b: usize) -> f64 {
        let (phi, theta) = self.pose.as_ref().map(SimulatedPose::get).unwrap_or((0.0, 0.0));
        let off_axis = (phi * phi + theta * theta) / (2.0 * self.beamwidth_deg.powi(2));
        let lobe_db = 20.0 * (-off_axis).exp().log10();
        // Cross-polar pairs sit well below co-polar ones.
        let polar_db = if a > b { 0.0 } else { -15.0 };
        self.peak_gain_db + lobe_db + polar_db
    }
}

impl Analyzer for SimulatedAnalyzer {
    fn read_sparam(&mut self, a: usize, b: usize) -> AnalyzerResult<Network> {
        if a == 0 || b == 0 || a > self.nports || b > self.nports {
            return Err(AnalyzerError::UnsupportedPortPair {
                a,
                b,
                nports: self.nports,
            });
        }
        if self.fail_after.is_some_and(|limit| self.reads >= limit) {
            return Err(AnalyzerError::Communication(
                "simulated instrument stopped responding".to_string(),
            ));
        }

        let level_db = if a == b { -20.0 } else { self.transmission_db(a, b) };
        let magnitude = 10f64.powf(level_db / 20.0);
        let s: Array1<Complex64> = self
            .frequency
            .hz()
            .mapv(|f| Complex64::from_polar(magnitude, -2.0 * PI * f * PATH_DELAY_S));

        self.reads += 1;
        debug!("Simulated S{a}{b} read at {level_db:.2} dB");
        Network::new(self.frequency.clone(), s)
            .map_err(|e| AnalyzerError::Communication(e.to_string()))
    }

    fn available_params(&self) -> Vec<(usize, usize)> {
        all_port_pairs(self.nports)
    }

    fn nports(&self) -> usize {
        self.nports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioner::{Positioner, SimulatedPositioner};
    use approx::assert_relative_eq;
    use shared::settings::SettingsStore;

    fn grid() -> Frequency {
        Frequency::linspace(8e9, 12e9, 21)
    }

    #[test]
    fn test_boresight_level() {
        let mut vna = SimulatedAnalyzer::new(grid()).with_peak_gain_db(-25.0);
        let n = vna.read_sparam(2, 1).unwrap();
        assert_eq!(n.len(), 21);
        for db in n.s_db() {
            assert_relative_eq!(db, -25.0, epsilon = 1e-9);
        }
        assert!(n.params().is_empty());
    }

    #[test]
    fn test_pattern_follows_pose() {
        let mut positioner = SimulatedPositioner::new(SettingsStore::in_memory());
        let mut vna = SimulatedAnalyzer::new(grid()).with_pose(positioner.pose());

        let on_axis = vna.read_sparam(2, 1).unwrap().s_db()[0];
        positioner.move_phi_absolute(45.0).unwrap();
        let off_axis = vna.read_sparam(2, 1).unwrap().s_db()[0];
        assert!(off_axis < on_axis - 3.0);
    }

    #[test]
    fn test_unsupported_pair() {
        let mut vna = SimulatedAnalyzer::new(grid());
        assert!(matches!(
            vna.read_sparam(3, 1),
            Err(AnalyzerError::UnsupportedPortPair { a: 3, b: 1, nports: 2 })
        ));
        assert_eq!(vna.available_params().len(), 4);
    }

    #[test]
    fn test_fail_after() {
        let mut vna = SimulatedAnalyzer::new(grid()).with_fail_after(1);
        vna.read_sparam(2, 1).unwrap();
        assert!(matches!(
            vna.read_sparam(2, 1),
            Err(AnalyzerError::Communication(_))
        ));
        assert_eq!(vna.read_count(), 1);
    }
}
