//! Scan grid and polarization settings for one experiment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A polarization label and the analyzer port pair that measures it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polarization {
    pub label: String,
    pub a: usize,
    pub b: usize,
}

impl Polarization {
    pub fn new(label: impl Into<String>, a: usize, b: usize) -> Self {
        Self {
            label: label.into(),
            a,
            b,
        }
    }
}

/// Parses `LABEL:A:B`, e.g. `V:2:1`.
impl FromStr for Polarization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [label, a, b] = parts[..] else {
            return Err(format!("Polarization must be LABEL:A:B, got '{s}'"));
        };
        if label.is_empty() {
            return Err("Polarization label cannot be empty".to_string());
        }
        let port = |v: &str| {
            v.parse::<usize>()
                .ok()
                .filter(|&p| p > 0)
                .ok_or_else(|| format!("Invalid port '{v}' in '{s}'"))
        };
        Ok(Self::new(label, port(a)?, port(b)?))
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.label, self.a, self.b)
    }
}

/// Configuration for one scan.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Inner axis, visited for every theta
    pub phis: Vec<f64>,
    /// Outer axis
    pub thetas: Vec<f64>,
    /// Read in this order at every grid point
    pub polarizations: Vec<Polarization>,
    /// Longest wait for a move's completion event. Elapsing counts as
    /// completion.
    pub move_timeout: Option<Duration>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            phis: vec![0.0],
            thetas: vec![0.0],
            polarizations: vec![Polarization::new("V", 2, 1)],
            move_timeout: None,
        }
    }
}

impl ExperimentConfig {
    pub fn new(phis: Vec<f64>, thetas: Vec<f64>, polarizations: Vec<Polarization>) -> Self {
        Self {
            phis,
            thetas,
            polarizations,
            move_timeout: None,
        }
    }

    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = Some(timeout);
        self
    }

    /// Number of (phi, theta) grid points.
    pub fn total_points(&self) -> usize {
        self.phis.len() * self.thetas.len()
    }

    /// Number of networks a complete run produces.
    pub fn total_samples(&self) -> usize {
        self.total_points() * self.polarizations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarization_parse() {
        let p: Polarization = "V:2:1".parse().unwrap();
        assert_eq!(p, Polarization::new("V", 2, 1));
        assert_eq!(p.to_string(), "V:2:1");

        assert!("V:2".parse::<Polarization>().is_err());
        assert!(":2:1".parse::<Polarization>().is_err());
        assert!("V:0:1".parse::<Polarization>().is_err());
        assert!("V:x:1".parse::<Polarization>().is_err());
    }

    #[test]
    fn test_totals() {
        let config = ExperimentConfig::new(
            vec![-10.0, 0.0, 10.0],
            vec![0.0, 30.0],
            vec![Polarization::new("V", 2, 1), Polarization::new("H", 1, 2)],
        );
        assert_eq!(config.total_points(), 6);
        assert_eq!(config.total_samples(), 12);
        assert_eq!(ExperimentConfig::new(vec![], vec![0.0], vec![]).total_points(), 0);
    }
}
