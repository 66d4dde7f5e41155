//! Adam with parameter groups and checkpointable moments, plus the learning-rate schedule.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{CebraError, Result};

const FIRST_MOMENT: &str = "m";
const SECOND_MOMENT: &str = "v";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Named parameters trained at a shared base learning rate.
pub struct ParamGroup {
    pub name: String,
    pub lr: f64,
    pub vars: Vec<(String, Var)>,
}

struct VarAdam {
    name: String,
    group: usize,
    var: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Adam with decoupled weight decay, laid out so its state can be saved and
/// restored exactly. Each group's learning rate is its base rate times the
/// current schedule factor.
pub struct Adam {
    vars: Vec<VarAdam>,
    base_lrs: Vec<f64>,
    group_names: Vec<String>,
    factor: f64,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn new(groups: Vec<ParamGroup>, params: ParamsAdam) -> Result<Self> {
        let mut vars = Vec::new();
        let mut base_lrs = Vec::with_capacity(groups.len());
        let mut group_names = Vec::with_capacity(groups.len());
        for (g, group) in groups.into_iter().enumerate() {
            if !(group.lr.is_finite() && group.lr > 0.0) {
                return Err(CebraError::InvalidConfig(format!(
                    "learning rate of group '{}' must be positive, got {}",
                    group.name, group.lr
                )));
            }
            for (name, var) in group.vars {
                if var.dtype() != DType::F32 && var.dtype() != DType::F64 {
                    continue;
                }
                let first_moment = var.zeros_like()?;
                let second_moment = var.zeros_like()?;
                vars.push(VarAdam {
                    name,
                    group: g,
                    var,
                    first_moment,
                    second_moment,
                });
            }
            base_lrs.push(group.lr);
            group_names.push(group.name);
        }
        Ok(Self {
            vars,
            base_lrs,
            group_names,
            factor: 1.0,
            step_t: 0,
            params,
        })
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn set_lr_factor(&mut self, factor: f64) {
        self.factor = factor;
    }

    /// Effective learning rate of a group.
    pub fn learning_rate(&self, group: &str) -> Option<f64> {
        self.group_names
            .iter()
            .position(|n| n == group)
            .map(|g| self.base_lrs[g] * self.factor)
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// `false` when any gradient of an optimized parameter holds NaN or Inf.
    pub fn grads_finite(&self, grads: &GradStore) -> Result<bool> {
        for va in &self.vars {
            if let Some(g) = grads.get(va.var.as_tensor()) {
                // f64 keeps a sum of large finite gradients from overflowing.
                let total = g.to_dtype(DType::F64)?.abs()?.sum_all()?.to_scalar::<f64>()?;
                if !total.is_finite() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));
        for va in self.vars.iter_mut() {
            let Some(g) = grads.get(va.var.as_tensor()) else {
                continue;
            };
            let lr = self.base_lrs[va.group] * self.factor;
            let theta = va.var.as_tensor();
            let m = ((&va.first_moment * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((&va.second_moment * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let decayed = (theta * (1.0 - lr * weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next = (decayed - (update * lr)?)?;
            va.var.set(&next)?;
            va.first_moment = m;
            va.second_moment = v;
        }
        Ok(())
    }

    /// Moment tensors keyed `m.<param>` and `v.<param>`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(2 * self.vars.len());
        for va in &self.vars {
            out.insert(format!("{FIRST_MOMENT}.{}", va.name), va.first_moment.copy()?);
            out.insert(format!("{SECOND_MOMENT}.{}", va.name), va.second_moment.copy()?);
        }
        Ok(out)
    }

    /// Restores moments written by [`Adam::state_tensors`]. Nothing changes unless every
    /// moment is present with the right shape.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, step_count: usize) -> Result<()> {
        let mut staged = Vec::with_capacity(self.vars.len());
        for va in &self.vars {
            let mut pair = Vec::with_capacity(2);
            for kind in [FIRST_MOMENT, SECOND_MOMENT] {
                let key = format!("{kind}.{}", va.name);
                let t = tensors.get(&key).ok_or_else(|| {
                    CebraError::Checkpoint(format!("missing optimizer state '{key}'"))
                })?;
                if t.dims() != va.var.dims() {
                    return Err(CebraError::Checkpoint(format!(
                        "optimizer state '{key}' has shape {:?}, expected {:?}",
                        t.dims(),
                        va.var.dims()
                    )));
                }
                pair.push(t.to_dtype(va.var.dtype())?.to_device(va.var.device())?);
            }
            staged.push(pair);
        }
        for (va, mut pair) in self.vars.iter_mut().zip(staged) {
            if let (Some(v), Some(m)) = (pair.pop(), pair.pop()) {
                va.first_moment = m;
                va.second_moment = v;
            }
        }
        self.step_t = step_count;
        Ok(())
    }

    /// Moments moved to `device`, for rebuilding the optimizer after a device change.
    pub fn moved_state(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(2 * self.vars.len());
        for va in &self.vars {
            out.insert(
                format!("{FIRST_MOMENT}.{}", va.name),
                va.first_moment.to_device(device)?,
            );
            out.insert(
                format!("{SECOND_MOMENT}.{}", va.name),
                va.second_moment.to_device(device)?,
            );
        }
        Ok(out)
    }
}

/// Learning-rate multiplier as a function of the absolute step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    Constant,
    /// Linear warmup over 8% of `horizon` (at most 2000 steps), flat for 30% of
    /// the rest, then cosine decay down to `min_factor`.
    WarmupCosine { horizon: usize, min_factor: f64 },
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::Constant
    }
}

impl LrSchedule {
    pub fn validate(&self) -> Result<()> {
        if let Self::WarmupCosine {
            horizon,
            min_factor,
        } = *self
        {
            if horizon == 0 {
                return Err(CebraError::InvalidConfig(
                    "warmup_cosine schedule needs a horizon of at least 1 step".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&min_factor) {
                return Err(CebraError::InvalidConfig(format!(
                    "min_factor must be within [0, 1], got {min_factor}"
                )));
            }
        }
        Ok(())
    }

    /// Factor for the update numbered `step` (1-based).
    pub fn factor(&self, step: usize) -> f64 {
        match *self {
            Self::Constant => 1.0,
            Self::WarmupCosine {
                horizon,
                min_factor,
            } => {
                let warmup = ((horizon as f64) * 0.08).round().max(1.0) as usize;
                let warmup = warmup.clamp(1, 2000);
                let flat_steps = ((horizon.saturating_sub(warmup) as f64) * 0.30).round() as usize;
                let decay_start = warmup + flat_steps;
                if step <= warmup {
                    step as f64 / warmup as f64
                } else if step <= decay_start {
                    1.0
                } else {
                    let progress = ((step - decay_start) as f64
                        / horizon.saturating_sub(decay_start).max(1) as f64)
                        .min(1.0);
                    let cos = (std::f64::consts::PI * progress).cos();
                    min_factor + 0.5 * (1.0 - min_factor) * (1.0 + cos)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_group(device: &Device) -> (Var, ParamGroup) {
        let var = Var::new(&[3f32, -2.0], device).unwrap();
        let group = ParamGroup {
            name: "main".to_string(),
            lr: 0.1,
            vars: vec![("x".to_string(), var.clone())],
        };
        (var, group)
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let device = Device::Cpu;
        let (var, group) = quadratic_group(&device);
        let mut opt = Adam::new(vec![group], ParamsAdam::default()).unwrap();
        for _ in 0..300 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let x = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(x.iter().all(|v| v.abs() < 0.05), "{x:?}");
        assert_eq!(opt.step_count(), 300);
    }

    #[test]
    fn test_state_round_trip_reproduces_updates() {
        let device = Device::Cpu;
        let run = |split: Option<usize>| {
            let (var, group) = quadratic_group(&device);
            let mut opt = Adam::new(vec![group], ParamsAdam::default()).unwrap();
            for i in 0..10 {
                if Some(i) == split {
                    let state = opt.state_tensors().unwrap();
                    let count = opt.step_count();
                    let group = ParamGroup {
                        name: "main".to_string(),
                        lr: 0.1,
                        vars: vec![("x".to_string(), var.clone())],
                    };
                    opt = Adam::new(vec![group], ParamsAdam::default()).unwrap();
                    opt.load_state(&state, count).unwrap();
                }
                let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
                opt.step(&loss.backward().unwrap()).unwrap();
            }
            var.as_tensor().to_vec1::<f32>().unwrap()
        };
        assert_eq!(run(None), run(Some(4)));
    }

    #[test]
    fn test_load_state_rejects_missing_moments() {
        let device = Device::Cpu;
        let (_, group) = quadratic_group(&device);
        let mut opt = Adam::new(vec![group], ParamsAdam::default()).unwrap();
        assert!(matches!(
            opt.load_state(&HashMap::new(), 3),
            Err(CebraError::Checkpoint(_))
        ));
        assert_eq!(opt.step_count(), 0);
    }

    #[test]
    fn test_large_finite_gradients_are_finite() {
        let device = Device::Cpu;
        let (var, group) = quadratic_group(&device);
        let opt = Adam::new(vec![group], ParamsAdam::default()).unwrap();

        // Each gradient is 3e38, their f32 sum is not representable.
        let loss = (var.as_tensor() * 3e38).unwrap().sum_all().unwrap();
        assert!(opt.grads_finite(&loss.backward().unwrap()).unwrap());

        let loss = (var.as_tensor() * f64::NAN).unwrap().sum_all().unwrap();
        assert!(!opt.grads_finite(&loss.backward().unwrap()).unwrap());
    }

    #[test]
    fn test_group_learning_rates_follow_factor() {
        let device = Device::Cpu;
        let (_, group) = quadratic_group(&device);
        let temp = ParamGroup {
            name: "temperature".to_string(),
            lr: 0.01,
            vars: vec![],
        };
        let mut opt = Adam::new(vec![group, temp], ParamsAdam::default()).unwrap();
        opt.set_lr_factor(0.5);
        assert_eq!(opt.learning_rate("main"), Some(0.05));
        assert_eq!(opt.learning_rate("temperature"), Some(0.005));
        assert_eq!(opt.learning_rate("other"), None);
    }

    #[test]
    fn test_warmup_cosine_shape() {
        let schedule = LrSchedule::WarmupCosine {
            horizon: 1000,
            min_factor: 0.1,
        };
        schedule.validate().unwrap();
        assert!((schedule.factor(40) - 0.5).abs() < 1e-12);
        assert_eq!(schedule.factor(80), 1.0);
        assert_eq!(schedule.factor(300), 1.0);
        assert!((schedule.factor(1000) - 0.1).abs() < 1e-12);
        assert!((schedule.factor(5000) - 0.1).abs() < 1e-12);
        assert_eq!(LrSchedule::Constant.factor(7), 1.0);
        assert!(LrSchedule::WarmupCosine {
            horizon: 0,
            min_factor: 0.0
        }
        .validate()
        .is_err());
    }
}
