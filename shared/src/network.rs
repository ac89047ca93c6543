//! Single-trace S-parameter network with attached scan parameters.
//!
//! A [`Network`] is one complex S-parameter trace over a frequency grid,
//! plus a string-keyed parameter map that records where in the scan the
//! trace was taken (`phi`, `theta`, `polarization`, `calibrated`).
//!
//! Frequencies are always stored in hertz. Angles are stored in degrees.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ndarray::Array1;
use num_complex::Complex64;
use thiserror::Error;

/// Parameter keys used by the measurement engine.
pub mod param {
    /// Azimuth-like positioner axis, degrees.
    pub const PHI: &str = "phi";
    /// Elevation-like positioner axis, degrees.
    pub const THETA: &str = "theta";
    /// Polarization label.
    pub const POLARIZATION: &str = "polarization";
    /// Whether a calibration has been applied.
    pub const CALIBRATED: &str = "calibrated";
}

/// Tolerance used when comparing angle parameters.
pub const ANGLE_TOLERANCE: f64 = 1e-9;

/// Relative tolerance used when comparing frequency grids.
const FREQUENCY_RELATIVE_TOLERANCE: f64 = 1e-12;

/// Error during network construction or arithmetic
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Sample count does not match the frequency grid
    #[error("length mismatch: {frequencies} frequencies but {samples} samples")]
    LengthMismatch { frequencies: usize, samples: usize },

    /// Two networks were combined over different frequency grids
    #[error("frequency grids differ ({left} vs {right} points)")]
    FrequencyMismatch { left: usize, right: usize },

    /// Target grid extends past the source grid
    #[error("cannot interpolate onto {target_min:.6e}..{target_max:.6e} Hz from {source_min:.6e}..{source_max:.6e} Hz")]
    OutOfRange {
        source_min: f64,
        source_max: f64,
        target_min: f64,
        target_max: f64,
    },

    /// Source grid is not strictly increasing
    #[error("frequency grid is not strictly increasing")]
    NotMonotonic,
}

/// Ordered frequency grid in hertz.
#[derive(Debug, Clone, PartialEq)]
pub struct Frequency {
    hz: Array1<f64>,
}

impl Frequency {
    /// Build a grid from explicit points in hertz.
    pub fn from_hz(points: impl Into<Vec<f64>>) -> Self {
        Self {
            hz: Array1::from_vec(points.into()),
        }
    }

    /// Evenly spaced grid including both endpoints.
    pub fn linspace(start_hz: f64, stop_hz: f64, points: usize) -> Self {
        Self {
            hz: Array1::linspace(start_hz, stop_hz, points),
        }
    }

    pub fn hz(&self) -> &Array1<f64> {
        &self.hz
    }

    pub fn len(&self) -> usize {
        self.hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hz.is_empty()
    }

    pub fn start(&self) -> Option<f64> {
        self.hz.get(0).copied()
    }

    pub fn stop(&self) -> Option<f64> {
        self.len().checked_sub(1).map(|i| self.hz[i])
    }

    /// True if both grids hold the same points (to within rounding of the
    /// text formats the grids travel through).
    pub fn same_grid(&self, other: &Frequency) -> bool {
        self.len() == other.len()
            && self.hz.iter().zip(other.hz.iter()).all(|(a, b)| {
                let scale = a.abs().max(b.abs()).max(1.0);
                (a - b).abs() <= FREQUENCY_RELATIVE_TOLERANCE * scale
            })
    }

    /// True if the grid is strictly increasing.
    pub fn is_monotonic(&self) -> bool {
        self.hz.windows(2).into_iter().all(|w| w[1] > w[0])
    }

    /// True if this grid is monotonic and spans every point of `target`.
    pub fn covers(&self, target: &Frequency) -> bool {
        match (self.start(), self.stop(), target.start(), target.stop()) {
            (Some(s0), Some(s1), Some(t0), Some(t1)) => {
                let slack = FREQUENCY_RELATIVE_TOLERANCE * s1.abs().max(1.0);
                self.is_monotonic() && t0.min(t1) >= s0 - slack && t0.max(t1) <= s1 + slack
            }
            (_, _, None, None) => true,
            _ => false,
        }
    }
}

/// Scalar value attached to a network parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Real(f64),
    Int(i64),
    Text(String),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Real(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Real(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Real(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Parameter map attached to each network. Ordered so schemas and files
/// are deterministic.
pub type Params = BTreeMap<String, ParamValue>;

/// A single S-parameter trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    frequency: Frequency,
    s: Array1<Complex64>,
    params: Params,
    name: Option<String>,
}

impl Network {
    /// Create a network from a frequency grid and matching complex samples.
    pub fn new(frequency: Frequency, s: Array1<Complex64>) -> Result<Self, NetworkError> {
        if frequency.len() != s.len() {
            return Err(NetworkError::LengthMismatch {
                frequencies: frequency.len(),
                samples: s.len(),
            });
        }
        Ok(Self {
            frequency,
            s,
            params: Params::new(),
            name: None,
        })
    }

    /// Create a network whose samples are purely real (e.g. a linear gain).
    pub fn from_real(frequency: Frequency, values: &[f64]) -> Result<Self, NetworkError> {
        let s = values.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        Self::new(frequency, s)
    }

    pub fn frequency(&self) -> &Frequency {
        &self.frequency
    }

    pub fn s(&self) -> &Array1<Complex64> {
        &self.s
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the whole parameter map.
    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set_param(key, value);
        self
    }

    /// Set the four scan parameters at once, discarding any others.
    pub fn tag(&mut self, phi: f64, theta: f64, polarization: &str, calibrated: bool) {
        let mut params = Params::new();
        params.insert(param::PHI.to_string(), ParamValue::Real(phi));
        params.insert(param::THETA.to_string(), ParamValue::Real(theta));
        params.insert(param::POLARIZATION.to_string(), polarization.into());
        params.insert(param::CALIBRATED.to_string(), ParamValue::Bool(calibrated));
        self.params = params;
    }

    /// Set of parameter keys, used for schema checks.
    pub fn param_keys(&self) -> BTreeSet<String> {
        self.params.keys().cloned().collect()
    }

    pub fn phi(&self) -> Option<f64> {
        self.param(param::PHI).and_then(ParamValue::as_f64)
    }

    pub fn theta(&self) -> Option<f64> {
        self.param(param::THETA).and_then(ParamValue::as_f64)
    }

    pub fn polarization(&self) -> Option<&str> {
        self.param(param::POLARIZATION).and_then(ParamValue::as_str)
    }

    /// Missing or non-boolean `calibrated` reads as false.
    pub fn is_calibrated(&self) -> bool {
        self.param(param::CALIBRATED)
            .and_then(ParamValue::as_bool)
            .unwrap_or(false)
    }

    /// Element-wise complex division, keeping this network's parameters.
    pub fn divide(&self, other: &Network) -> Result<Network, NetworkError> {
        self.check_grid(other)?;
        Ok(Network {
            frequency: self.frequency.clone(),
            s: &self.s / &other.s,
            params: self.params.clone(),
            name: self.name.clone(),
        })
    }

    /// Element-wise complex multiplication, keeping this network's parameters.
    pub fn multiply(&self, other: &Network) -> Result<Network, NetworkError> {
        self.check_grid(other)?;
        Ok(Network {
            frequency: self.frequency.clone(),
            s: &self.s * &other.s,
            params: self.params.clone(),
            name: self.name.clone(),
        })
    }

    fn check_grid(&self, other: &Network) -> Result<(), NetworkError> {
        if self.frequency.same_grid(&other.frequency) {
            Ok(())
        } else {
            Err(NetworkError::FrequencyMismatch {
                left: self.frequency.len(),
                right: other.frequency.len(),
            })
        }
    }

    /// Linearly interpolate real and imaginary parts onto `target`.
    ///
    /// The source grid must be strictly increasing and span the target grid.
    pub fn interpolate(&self, target: &Frequency) -> Result<Network, NetworkError> {
        if self.frequency.same_grid(target) {
            return Ok(self.clone());
        }
        if !self.frequency.is_monotonic() {
            return Err(NetworkError::NotMonotonic);
        }
        if !self.frequency.covers(target) {
            return Err(NetworkError::OutOfRange {
                source_min: self.frequency.start().unwrap_or(f64::NAN),
                source_max: self.frequency.stop().unwrap_or(f64::NAN),
                target_min: target.start().unwrap_or(f64::NAN),
                target_max: target.stop().unwrap_or(f64::NAN),
            });
        }

        let src = self.frequency.hz().to_vec();
        let last = src.len() - 1;
        let s = target
            .hz()
            .iter()
            .map(|&f| {
                // First index whose frequency is >= f
                let upper = src.partition_point(|&x| x < f).min(last);
                if upper == 0 {
                    return self.s[0];
                }
                let lower = upper - 1;
                let span = src[upper] - src[lower];
                let t = ((f - src[lower]) / span).clamp(0.0, 1.0);
                self.s[lower] + (self.s[upper] - self.s[lower]) * t
            })
            .collect();

        Ok(Network {
            frequency: target.clone(),
            s,
            params: self.params.clone(),
            name: self.name.clone(),
        })
    }

    /// Magnitude in dB (20·log10|s|).
    pub fn s_db(&self) -> Array1<f64> {
        self.s.mapv(|c| 20.0 * c.norm().log10())
    }

    pub fn s_mag(&self) -> Array1<f64> {
        self.s.mapv(|c| c.norm())
    }

    /// Phase in degrees.
    pub fn s_deg(&self) -> Array1<f64> {
        self.s.mapv(|c| c.arg().to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat(freq: &Frequency, value: Complex64) -> Network {
        Network::new(freq.clone(), Array1::from_elem(freq.len(), value)).unwrap()
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let freq = Frequency::linspace(1e9, 2e9, 3);
        let result = Network::new(freq, Array1::zeros(2));
        assert!(matches!(
            result,
            Err(NetworkError::LengthMismatch {
                frequencies: 3,
                samples: 2
            })
        ));
    }

    #[test]
    fn test_tag_sets_scan_params() {
        let freq = Frequency::linspace(1e9, 2e9, 3);
        let mut ntwk = flat(&freq, Complex64::new(1.0, 0.0)).with_param("stale", 1.0);
        ntwk.tag(-10.0, 30.0, "V", false);

        assert_eq!(ntwk.phi(), Some(-10.0));
        assert_eq!(ntwk.theta(), Some(30.0));
        assert_eq!(ntwk.polarization(), Some("V"));
        assert!(!ntwk.is_calibrated());
        assert!(ntwk.param("stale").is_none());
        assert_eq!(ntwk.param_keys().len(), 4);
    }

    #[test]
    fn test_divide_is_complex_division() {
        let freq = Frequency::linspace(1e9, 2e9, 4);
        let a = flat(&freq, Complex64::new(0.0, 10.0)).with_param("phi", 5.0);
        let b = flat(&freq, Complex64::new(0.0, 5.0));

        let q = a.divide(&b).unwrap();
        for c in q.s() {
            assert_relative_eq!(c.re, 2.0, epsilon = 1e-12);
            assert_relative_eq!(c.im, 0.0, epsilon = 1e-12);
        }
        assert_eq!(q.phi(), Some(5.0));

        let back = q.multiply(&b).unwrap();
        for (x, y) in back.s().iter().zip(a.s().iter()) {
            assert_relative_eq!(x.re, y.re, epsilon = 1e-12);
            assert_relative_eq!(x.im, y.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_divide_rejects_other_grid() {
        let a = flat(&Frequency::linspace(1e9, 2e9, 4), Complex64::new(1.0, 0.0));
        let b = flat(&Frequency::linspace(1e9, 2e9, 5), Complex64::new(1.0, 0.0));
        assert!(matches!(
            a.divide(&b),
            Err(NetworkError::FrequencyMismatch { left: 4, right: 5 })
        ));
    }

    #[test]
    fn test_interpolate_linear() {
        let src = Frequency::from_hz(vec![1e9, 2e9, 3e9]);
        let ntwk = Network::from_real(src, &[1.0, 3.0, 5.0]).unwrap();

        let target = Frequency::from_hz(vec![1.5e9, 2.0e9, 2.75e9]);
        let out = ntwk.interpolate(&target).unwrap();

        assert_relative_eq!(out.s()[0].re, 2.0, epsilon = 1e-12);
        assert_relative_eq!(out.s()[1].re, 3.0, epsilon = 1e-12);
        assert_relative_eq!(out.s()[2].re, 4.5, epsilon = 1e-12);
        assert_eq!(out.frequency(), &target);
    }

    #[test]
    fn test_interpolate_out_of_range() {
        let src = Frequency::from_hz(vec![1e9, 2e9]);
        let ntwk = Network::from_real(src, &[1.0, 1.0]).unwrap();
        let target = Frequency::from_hz(vec![0.5e9, 1.5e9]);
        assert!(matches!(
            ntwk.interpolate(&target),
            Err(NetworkError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_interpolate_dense_grid_hits_every_interval() {
        let src = Frequency::linspace(1e9, 2e9, 1001);
        let values: Vec<f64> = src.hz().iter().map(|f| f / 1e9).collect();
        let ntwk = Network::from_real(src, &values).unwrap();

        let target = Frequency::linspace(1.0005e9, 1.9995e9, 777);
        let out = ntwk.interpolate(&target).unwrap();
        for (f, s) in target.hz().iter().zip(out.s().iter()) {
            assert_relative_eq!(s.re, f / 1e9, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_s_deg() {
        let freq = Frequency::from_hz(vec![1e9, 2e9, 3e9]);
        let s = Array1::from_vec(vec![
            Complex64::new(0.0, 2.0),
            Complex64::new(-1.0, 0.0),
            Complex64::new(1.0, -1.0),
        ]);
        let ntwk = Network::new(freq, s).unwrap();
        let deg = ntwk.s_deg();
        assert_relative_eq!(deg[0], 90.0, epsilon = 1e-12);
        assert_relative_eq!(deg[1], 180.0, epsilon = 1e-12);
        assert_relative_eq!(deg[2], -45.0, epsilon = 1e-12);
    }

    #[test]
    fn test_s_db() {
        let freq = Frequency::from_hz(vec![1e9]);
        let ntwk = Network::from_real(freq, &[0.1]).unwrap();
        assert_relative_eq!(ntwk.s_db()[0], -20.0, epsilon = 1e-10);
    }
}
