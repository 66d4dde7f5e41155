//! Safetensors reader for datasets used by the command line.
//!
//! A dataset file holds a `neural` tensor `[samples, features]` and optionally
//! `continuous` (`[samples]` or `[samples, dims]`) and `discrete` (`[samples]`)
//! auxiliary variables.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use super::data::TensorDataset;
use crate::error::{CebraError, Result};

pub const NEURAL_KEY: &str = "neural";
pub const CONTINUOUS_KEY: &str = "continuous";
pub const DISCRETE_KEY: &str = "discrete";

pub fn load_dataset(path: &Path, device: &Device) -> Result<TensorDataset> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    let neural = tensors.remove(NEURAL_KEY).ok_or_else(|| {
        CebraError::InvalidData(format!("{path:?} has no '{NEURAL_KEY}' tensor"))
    })?;
    let mut dataset = TensorDataset::new(neural)?;
    if let Some(continuous) = tensors.remove(CONTINUOUS_KEY) {
        let dim = match continuous.dims() {
            [_] => 1,
            [_, d] => *d,
            other => {
                return Err(CebraError::InvalidData(format!(
                    "'{CONTINUOUS_KEY}' must be 1D or 2D, got {other:?}"
                )))
            }
        };
        let values = continuous
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        dataset = dataset.with_continuous(values, dim)?;
    }
    if let Some(discrete) = tensors.remove(DISCRETE_KEY) {
        let labels = discrete
            .flatten_all()?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        dataset = dataset.with_discrete(labels)?;
    }
    Ok(dataset)
}

/// Write embeddings (or any named tensors) to a safetensors file.
pub fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    candle_core::safetensors::save(tensors, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;

    #[test]
    fn test_load_dataset_with_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.safetensors");
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            NEURAL_KEY.to_string(),
            Tensor::from_vec((0..12).map(|v| v as f32).collect::<Vec<_>>(), (4, 3), &device)
                .unwrap(),
        );
        tensors.insert(
            CONTINUOUS_KEY.to_string(),
            Tensor::from_vec(vec![0.0f32, 0.5, 1.0, 1.5], (4,), &device).unwrap(),
        );
        tensors.insert(
            DISCRETE_KEY.to_string(),
            Tensor::from_vec(vec![0u32, 1, 1, 0], (4,), &device).unwrap(),
        );
        save_tensors(&tensors, &path).unwrap();

        let ds = load_dataset(&path, &device).unwrap();
        assert_eq!(ds.len(), 4);
        assert_eq!(ds.input_dimension(), 3);
        assert_eq!(ds.continuous().unwrap().dim(), 1);
        assert_eq!(ds.discrete().unwrap(), &[0, 1, 1, 0]);
    }

    #[test]
    fn test_missing_signal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "other".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        save_tensors(&tensors, &path).unwrap();
        assert!(matches!(
            load_dataset(&path, &Device::Cpu),
            Err(CebraError::InvalidData(_))
        ));
    }
}
