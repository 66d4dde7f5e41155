//! Seeded parameter creation and bulk access to a [`VarMap`].
//!
//! candle's own initializers draw from an unseeded RNG on the CPU backend, so
//! parameters are created here from a caller-provided `StdRng` instead. That
//! makes two solvers built from the same seed start from identical weights.

use std::collections::{BTreeMap, HashMap};
use std::sync::MutexGuard;

use candle_core::{Device, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarMap};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{CebraError, Result};

pub(crate) fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap.data().lock().map_err(|_| CebraError::LockPoisoned)
}

/// Creates named parameters inside a [`VarMap`], reusing entries that already exist.
pub struct ParamBuilder<'a> {
    varmap: &'a VarMap,
    rng: &'a mut StdRng,
    device: &'a Device,
    prefix: String,
}

impl<'a> ParamBuilder<'a> {
    pub fn new(varmap: &'a VarMap, rng: &'a mut StdRng, device: &'a Device) -> Self {
        Self {
            varmap,
            rng,
            device,
            prefix: String::new(),
        }
    }

    /// Builder for a nested scope, e.g. `pp("encoder").pp(0)` names `encoder.0.*`.
    pub fn pp(&mut self, name: impl ToString) -> ParamBuilder<'_> {
        let prefix = self.path(&name.to_string());
        ParamBuilder {
            varmap: self.varmap,
            rng: &mut *self.rng,
            device: self.device,
            prefix,
        }
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn get_or_init(
        &mut self,
        name: &str,
        shape: &[usize],
        init: impl FnOnce(&mut StdRng, usize) -> Vec<f32>,
    ) -> Result<Tensor> {
        let path = self.path(name);
        let mut vars = lock_vars(self.varmap)?;
        if let Some(var) = vars.get(&path) {
            if var.dims() != shape {
                return Err(CebraError::InvalidConfig(format!(
                    "parameter {path} has shape {:?}, expected {:?}",
                    var.dims(),
                    shape
                )));
            }
            return Ok(var.as_tensor().clone());
        }
        let count = shape.iter().product();
        let values = init(&mut *self.rng, count);
        let var = Var::from_tensor(&Tensor::from_vec(values, shape.to_vec(), self.device)?)?;
        let tensor = var.as_tensor().clone();
        vars.insert(path, var);
        Ok(tensor)
    }

    /// Uniform initialization in `[-bound, bound)`.
    pub fn uniform(&mut self, name: &str, shape: &[usize], bound: f64) -> Result<Tensor> {
        let bound = bound as f32;
        self.get_or_init(name, shape, |rng, count| {
            (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
        })
    }

    pub fn constant(&mut self, name: &str, shape: &[usize], value: f32) -> Result<Tensor> {
        self.get_or_init(name, shape, |_, count| vec![value; count])
    }

    /// 1D convolution with fan-in scaled uniform init for weight and bias.
    pub fn conv1d(&mut self, in_channels: usize, out_channels: usize, kernel: usize) -> Result<Conv1d> {
        let bound = 1.0 / ((in_channels * kernel) as f64).sqrt();
        let weight = self.uniform("weight", &[out_channels, in_channels, kernel], bound)?;
        let bias = self.uniform("bias", &[out_channels], bound)?;
        Ok(Conv1d::new(weight, Some(bias), Conv1dConfig::default()))
    }

    pub fn linear(&mut self, in_features: usize, out_features: usize) -> Result<Linear> {
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = self.uniform("weight", &[out_features, in_features], bound)?;
        let bias = self.uniform("bias", &[out_features], bound)?;
        Ok(Linear::new(weight, Some(bias)))
    }
}

/// Deep copy of every parameter, sorted by name.
pub fn snapshot_vars(varmap: &VarMap) -> Result<BTreeMap<String, Tensor>> {
    let vars = lock_vars(varmap)?;
    let mut out = BTreeMap::new();
    for (name, var) in vars.iter() {
        out.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(out)
}

/// Parameters sorted by name, for deterministic optimizer ordering.
pub fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let vars = lock_vars(varmap)?;
    let mut out: Vec<(String, Var)> = vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Overwrite every parameter of `varmap` with the tensor of the same name.
///
/// All names and shapes are checked before anything is written, so a mismatch
/// leaves the parameters untouched.
pub fn assign_vars(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let vars = lock_vars(varmap)?;
    let mut staged = Vec::with_capacity(vars.len());
    for (name, var) in vars.iter() {
        let src = tensors.get(name).ok_or_else(|| {
            CebraError::Checkpoint(format!("missing parameter '{name}'"))
        })?;
        if src.dims() != var.dims() {
            return Err(CebraError::Checkpoint(format!(
                "parameter '{name}' has shape {:?}, expected {:?}",
                src.dims(),
                var.dims()
            )));
        }
        let src = src
            .to_dtype(var.dtype())?
            .to_device(var.device())?;
        staged.push((var, src));
    }
    for (var, src) in staged {
        var.set(&src)?;
    }
    Ok(())
}

/// Number of scalar values held by the parameter store.
pub fn count_parameters(varmap: &VarMap) -> Result<usize> {
    let vars = lock_vars(varmap)?;
    Ok(vars.values().map(|v| v.elem_count()).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_seeded_init_is_reproducible() {
        let device = Device::Cpu;
        let build = || {
            let varmap = VarMap::new();
            let mut rng = StdRng::seed_from_u64(7);
            let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
            params.pp("layer").conv1d(3, 4, 2).unwrap();
            snapshot_vars(&varmap).unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["layer.bias", "layer.weight"]);
        for (name, t) in &a {
            let lhs = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let rhs = b[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(lhs, rhs, "{name}");
        }
    }

    #[test]
    fn test_nested_scopes_join_with_dots() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(2);
        let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
        params.pp("encoder").pp(0).conv1d(2, 2, 1).unwrap();
        params.pp("encoder").pp(1).conv1d(2, 2, 1).unwrap();
        let names: Vec<String> = snapshot_vars(&varmap).unwrap().into_keys().collect();
        assert_eq!(
            names,
            vec!["encoder.0.bias", "encoder.0.weight", "encoder.1.bias", "encoder.1.weight"]
        );
    }

    #[test]
    fn test_existing_parameter_is_reused() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
        let first = params.constant("t", &[2], 1.5).unwrap();
        let second = params.uniform("t", &[2], 1.0).unwrap();
        assert_eq!(second.to_vec1::<f32>().unwrap(), vec![1.5, 1.5]);
        assert_eq!(first.id(), second.id());
        assert!(params.uniform("t", &[3], 1.0).is_err());
    }

    #[test]
    fn test_assign_is_all_or_nothing() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
        params.constant("a", &[2], 0.0).unwrap();
        params.constant("b", &[2], 0.0).unwrap();

        let mut partial = HashMap::new();
        partial.insert("a".to_string(), Tensor::new(&[1f32, 1.0], &device).unwrap());
        assert!(assign_vars(&varmap, &partial).is_err());
        let snap = snapshot_vars(&varmap).unwrap();
        assert_eq!(snap["a"].to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);

        partial.insert("b".to_string(), Tensor::new(&[2f32, 2.0], &device).unwrap());
        assign_vars(&varmap, &partial).unwrap();
        let snap = snapshot_vars(&varmap).unwrap();
        assert_eq!(snap["b"].to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
        assert_eq!(count_parameters(&varmap).unwrap(), 4);
    }
}
