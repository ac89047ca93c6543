//! Per-model constants for stepper turntables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Motor and controller settings for one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub steps_per_degree: f64,
    /// Absolute step count loaded into the controller at startup
    pub initial_count: i64,
    pub run_current: u32,
    pub hold_current: u32,
    pub dwell_ms: u32,
    pub step_submode: u32,
    pub encoder_mode: u32,
    /// +1 or -1, applied when converting degrees to steps
    pub step_sign: i8,
    /// Controller direction flag (0 or 1) sent at init
    pub direction: u8,
    pub start_speed: u32,
    pub end_speed: u32,
    pub slope: u32,
}

impl AxisConfig {
    /// Signed step count for a move of `degrees`.
    pub fn steps_for(&self, degrees: f64) -> i64 {
        (f64::from(self.step_sign.signum()) * self.steps_per_degree * degrees).round() as i64
    }

    /// Degrees travelled for a signed step count.
    pub fn degrees_for(&self, steps: i64) -> f64 {
        steps as f64 / (f64::from(self.step_sign.signum()) * self.steps_per_degree)
    }
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            steps_per_degree: 320.0,
            initial_count: 100_000,
            run_current: 25,
            hold_current: 5,
            dwell_ms: 50,
            step_submode: 8,
            encoder_mode: 0,
            step_sign: 1,
            direction: 0,
            start_speed: 200,
            end_speed: 1600,
            slope: 4,
        }
    }
}

/// Full description of one turntable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurntableConfig {
    pub manufacturer: String,
    pub model: String,
    /// Controller X axis
    pub theta: AxisConfig,
    /// Controller Y axis
    pub phi: AxisConfig,
    pub baud_rate: u32,
    /// Serial read timeout, also the status poll interval
    pub timeout_ms: u64,
    /// Longest a single move may take before it is reported as stuck
    pub max_move_secs: f64,
}

impl Default for TurntableConfig {
    fn default() -> Self {
        Self {
            manufacturer: "Generic".to_string(),
            model: "Stepper Turntable".to_string(),
            theta: AxisConfig::default(),
            phi: AxisConfig {
                step_sign: -1,
                ..AxisConfig::default()
            },
            baud_rate: 9600,
            timeout_ms: 100,
            max_move_secs: 300.0,
        }
    }
}

impl TurntableConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_move_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_move_secs.max(0.0))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, axis) in [("theta", &self.theta), ("phi", &self.phi)] {
            if !(axis.steps_per_degree.is_finite() && axis.steps_per_degree > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.steps_per_degree must be positive"
                )));
            }
            if !matches!(axis.step_sign, 1 | -1) {
                return Err(ConfigError::Invalid(format!("{name}.step_sign must be +1 or -1")));
            }
            if axis.direction > 1 {
                return Err(ConfigError::Invalid(format!("{name}.direction must be 0 or 1")));
            }
        }
        if !(self.max_move_secs.is_finite() && self.max_move_secs > 0.0) {
            return Err(ConfigError::Invalid("max_move_secs must be positive".to_string()));
        }
        Ok(())
    }
}
