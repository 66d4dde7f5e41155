use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::criterion::{Distance, Temperature};
use crate::distributions::Conditional;
use crate::error::{CebraError, Result};
use crate::model::Architecture;
use crate::optim::LrSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureMode {
    Constant,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    InfoNce,
    Mse,
}

impl FromStr for TemperatureMode {
    type Err = CebraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constant" => Ok(Self::Constant),
            "auto" => Ok(Self::Auto),
            other => Err(CebraError::InvalidConfig(format!(
                "unknown temperature mode '{other}', expected constant or auto"
            ))),
        }
    }
}

impl FromStr for CriterionKind {
    type Err = CebraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "infonce" | "info_nce" => Ok(Self::InfoNce),
            "mse" => Ok(Self::Mse),
            other => Err(CebraError::InvalidConfig(format!(
                "unknown criterion '{other}', expected infonce or mse"
            ))),
        }
    }
}

/// Hyperparameters shared by every solver. Missing JSON fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Encoder architecture name, e.g. `offset10-model`.
    pub model: String,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub output_dimension: usize,
    pub num_hidden_units: usize,
    pub criterion: CriterionKind,
    pub distance: Distance,
    pub temperature_mode: TemperatureMode,
    pub temperature: f32,
    pub min_temperature: f32,
    /// Learning rate of the temperature parameter, `learning_rate` when unset.
    pub temperature_learning_rate: Option<f64>,
    /// Hinge margin of the MSE criterion, 0 disables the negative term.
    pub mse_margin: f32,
    pub conditional: Conditional,
    /// Maximum positive shift for `time`, label lag for `time_delta`.
    pub time_offset: usize,
    /// Noise scale for `delta`, and the label-matching tolerance for positives.
    pub delta: f32,
    /// Multi-session only: one encoder for every session.
    pub share_encoder: bool,
    pub weight_decay: f64,
    pub lr_schedule: LrSchedule,
    pub device: String,
    pub seed: u64,
    /// Steps between progress logs, 0 disables them.
    pub log_interval: usize,
    /// Steps between periodic checkpoints in `output_dir`, 0 disables them.
    pub checkpoint_interval: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            model: Architecture::Offset10.name().to_string(),
            batch_size: 512,
            learning_rate: 3e-4,
            output_dimension: 8,
            num_hidden_units: 32,
            criterion: CriterionKind::InfoNce,
            distance: Distance::Cosine,
            temperature_mode: TemperatureMode::Constant,
            temperature: 1.0,
            min_temperature: 0.1,
            temperature_learning_rate: None,
            mse_margin: 0.0,
            conditional: Conditional::TimeDelta,
            time_offset: 10,
            delta: 0.1,
            share_encoder: false,
            weight_decay: 0.0,
            lr_schedule: LrSchedule::Constant,
            device: "cuda_if_available".to_string(),
            seed: 0,
            log_interval: 100,
            checkpoint_interval: 0,
            output_dir: None,
        }
    }
}

impl SolverConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn architecture(&self) -> Result<Architecture> {
        self.model.parse()
    }

    pub fn temperature(&self) -> Temperature {
        match self.temperature_mode {
            TemperatureMode::Constant => Temperature::Constant(self.temperature),
            TemperatureMode::Auto => Temperature::Auto {
                initial: self.temperature,
                min: self.min_temperature,
            },
        }
    }

    pub fn temperature_learning_rate(&self) -> f64 {
        self.temperature_learning_rate.unwrap_or(self.learning_rate)
    }

    /// All configuration checks that do not depend on the data.
    pub fn validate(&self) -> Result<()> {
        let arch = self.architecture()?;
        let invalid = |msg: String| Err(CebraError::InvalidConfig(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if let Some(lr) = self.temperature_learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                return invalid(format!("temperature_learning_rate must be positive, got {lr}"));
            }
        }
        if self.output_dimension == 0 {
            return invalid("output_dimension must be at least 1".to_string());
        }
        if self.num_hidden_units < arch.min_hidden_units() {
            return invalid(format!(
                "{arch} needs at least {} hidden units, got {}",
                arch.min_hidden_units(),
                self.num_hidden_units
            ));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return invalid(format!("temperature must be positive, got {}", self.temperature));
        }
        if self.temperature_mode == TemperatureMode::Auto {
            if !(self.min_temperature.is_finite() && self.min_temperature > 0.0) {
                return invalid(format!(
                    "min_temperature must be positive, got {}",
                    self.min_temperature
                ));
            }
            if self.temperature < self.min_temperature {
                return invalid(format!(
                    "temperature {} is below min_temperature {}",
                    self.temperature, self.min_temperature
                ));
            }
        }
        if self.criterion == CriterionKind::Mse && arch.normalize() {
            return invalid(format!(
                "mse criterion needs an unnormalized model, {arch} projects onto the hypersphere"
            ));
        }
        if !(self.mse_margin.is_finite() && self.mse_margin >= 0.0) {
            return invalid(format!("mse_margin must be non-negative, got {}", self.mse_margin));
        }
        if self.time_offset == 0 {
            return invalid("time_offset must be at least 1".to_string());
        }
        if !(self.delta.is_finite() && self.delta >= 0.0) {
            return invalid(format!("delta must be non-negative, got {}", self.delta));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return invalid(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if self.checkpoint_interval > 0 && self.output_dir.is_none() {
            return invalid("checkpoint_interval needs an output_dir".to_string());
        }
        self.lr_schedule.validate()?;
        crate::device::parse_device_spec(&self.device)?;
        Ok(())
    }
}
