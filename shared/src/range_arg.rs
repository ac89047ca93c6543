//! Angle sweep arguments for scan grids.
//!
//! An axis can be given as an inclusive range `start:stop:step`, a comma
//! separated list `-10,0,10`, or a single value `0`.

use std::fmt;
use std::str::FromStr;

/// Slack allowed when deciding whether `stop` is reached.
const STOP_SLACK: f64 = 1e-9;

/// Parse `start:stop:step` into a validated tuple.
///
/// The step must be non-zero and point from start toward stop. A range with
/// `start == stop` is a single point.
pub fn parse_range(s: &str) -> Result<(f64, f64, f64), String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [start, stop, step] = parts[..] else {
        return Err("Range must be in format 'start:stop:step'".to_string());
    };

    let parse = |v: &str, what: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|_| format!("Invalid {what} value '{}'", v.trim()))
    };
    let start = parse(start, "start")?;
    let stop = parse(stop, "stop")?;
    let step = parse(step, "step")?;

    if step == 0.0 || !step.is_finite() {
        return Err("Step must be non-zero".to_string());
    }
    if (stop - start) * step < 0.0 {
        return Err(format!(
            "Step {step} does not move from {start} toward {stop}"
        ));
    }

    Ok((start, stop, step))
}

/// Inclusive `start:stop:step` range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeArg(pub f64, pub f64, pub f64);

impl FromStr for RangeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, stop, step) = parse_range(s)?;
        Ok(RangeArg(start, stop, step))
    }
}

impl fmt::Display for RangeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0, self.1, self.2)
    }
}

impl RangeArg {
    pub fn start(&self) -> f64 {
        self.0
    }

    pub fn stop(&self) -> f64 {
        self.1
    }

    pub fn step(&self) -> f64 {
        self.2
    }

    /// Number of points, including both ends when the step divides evenly.
    pub fn count(&self) -> usize {
        let span = (self.1 - self.0) / self.2;
        (span + STOP_SLACK).floor().max(0.0) as usize + 1
    }

    /// Every value in the range. Computed as `start + i * step` so long
    /// sweeps do not accumulate rounding error.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.count())
            .map(|i| self.0 + i as f64 * self.2)
            .collect()
    }
}

/// One scan axis: a range, an explicit list, or a single angle.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleSweep(Vec<f64>);

impl AngleSweep {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.0
    }
}

impl FromStr for AngleSweep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(AngleSweep(Vec::new()));
        }
        if s.contains(':') {
            return Ok(AngleSweep(s.parse::<RangeArg>()?.to_vec()));
        }
        s.split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid angle '{}'", v.trim()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(AngleSweep)
    }
}

impl fmt::Display for AngleSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}
