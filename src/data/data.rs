use candle_core::{DType, Device, Tensor};

use super::offset::Offset;
use crate::error::{CebraError, Result};

/// Source of windowed encoder inputs and the auxiliary variables used for sampling.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of features per sample.
    fn input_dimension(&self) -> usize;

    fn device(&self) -> &Device;

    /// The full `[samples, features]` signal.
    fn signal(&self) -> &Tensor;

    /// Windows around the given center indices, shaped `[batch, features, offset.len()]`.
    fn get_input(&self, indices: &[usize], offset: Offset) -> Result<Tensor>;

    fn continuous(&self) -> Option<&ContinuousLabels>;

    fn discrete(&self) -> Option<&[u32]>;
}

/// Row-major continuous auxiliary variables, one row of `dim` values per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousLabels {
    values: Vec<f32>,
    dim: usize,
}

impl ContinuousLabels {
    pub fn new(values: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(CebraError::InvalidData(
                "continuous labels need at least one dimension".to_string(),
            ));
        }
        if values.len() % dim != 0 {
            return Err(CebraError::InvalidData(format!(
                "{} continuous label values do not divide into rows of {}",
                values.len(),
                dim
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CebraError::InvalidData(
                "continuous labels contain NaN or Inf".to_string(),
            ));
        }
        Ok(Self { values, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.values.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.values[index * self.dim..(index + 1) * self.dim]
    }

    /// Squared euclidean distance between row `index` and `query`.
    pub fn sq_distance(&self, index: usize, query: &[f32]) -> f32 {
        self.row(index)
            .iter()
            .zip(query)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Single recording: an `[N, C]` signal with optional labels.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    neural: Tensor,
    continuous: Option<ContinuousLabels>,
    discrete: Option<Vec<u32>>,
}

impl TensorDataset {
    /// Wrap a 2D `[samples, features]` tensor. Values must be finite.
    pub fn new(neural: Tensor) -> Result<Self> {
        let (num_samples, num_features) = neural.dims2().map_err(|_| {
            CebraError::InvalidData(format!(
                "signal must be 2D [samples, features], got shape {:?}",
                neural.dims()
            ))
        })?;
        if num_samples == 0 || num_features == 0 {
            return Err(CebraError::InvalidData(format!(
                "signal needs at least one sample and one feature, got [{num_samples}, {num_features}]"
            )));
        }
        let neural = neural.to_dtype(DType::F32)?.contiguous()?;
        let values = neural.flatten_all()?.to_vec1::<f32>()?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CebraError::InvalidData(
                "signal contains NaN or Inf".to_string(),
            ));
        }
        Ok(Self {
            neural,
            continuous: None,
            discrete: None,
        })
    }

    pub fn from_vec(
        values: Vec<f32>,
        num_samples: usize,
        num_features: usize,
        device: &Device,
    ) -> Result<Self> {
        if values.len() != num_samples * num_features {
            return Err(CebraError::InvalidData(format!(
                "expected {} values for [{num_samples}, {num_features}], got {}",
                num_samples * num_features,
                values.len()
            )));
        }
        Self::new(Tensor::from_vec(values, (num_samples, num_features), device)?)
    }

    pub fn with_continuous(mut self, values: Vec<f32>, dim: usize) -> Result<Self> {
        let labels = ContinuousLabels::new(values, dim)?;
        if labels.len() != self.len() {
            return Err(CebraError::InvalidData(format!(
                "{} continuous label rows for {} samples",
                labels.len(),
                self.len()
            )));
        }
        self.continuous = Some(labels);
        Ok(self)
    }

    pub fn with_discrete(mut self, labels: Vec<u32>) -> Result<Self> {
        if labels.len() != self.len() {
            return Err(CebraError::InvalidData(format!(
                "{} discrete labels for {} samples",
                labels.len(),
                self.len()
            )));
        }
        self.discrete = Some(labels);
        Ok(self)
    }

    pub fn neural(&self) -> &Tensor {
        &self.neural
    }

    /// Move the signal to `device`. On failure the dataset stays where it was.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        let moved = self.neural.to_device(device)?;
        self.neural = moved;
        Ok(())
    }

    fn window_indices(&self, indices: &[usize], offset: Offset) -> Result<Vec<u32>> {
        let valid = offset.valid_range(self.len());
        let window = offset.len();
        let mut flat = Vec::with_capacity(indices.len() * window);
        for &center in indices {
            if !valid.contains(&center) {
                return Err(CebraError::Sampling(format!(
                    "index {center} outside valid range {valid:?} for {offset}"
                )));
            }
            let start = center - offset.left();
            flat.extend((start..start + window).map(|i| i as u32));
        }
        Ok(flat)
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.neural.dims()[0]
    }

    fn input_dimension(&self) -> usize {
        self.neural.dims()[1]
    }

    fn device(&self) -> &Device {
        self.neural.device()
    }

    fn signal(&self) -> &Tensor {
        &self.neural
    }

    fn get_input(&self, indices: &[usize], offset: Offset) -> Result<Tensor> {
        let window = offset.len();
        let flat = self.window_indices(indices, offset)?;
        let flat = Tensor::from_vec(flat, (indices.len() * window,), self.neural.device())?;
        // [B*W, C] -> [B, W, C] -> [B, C, W]
        let rows = self.neural.index_select(&flat, 0)?;
        let windows = rows
            .reshape((indices.len(), window, self.input_dimension()))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(windows)
    }

    fn continuous(&self) -> Option<&ContinuousLabels> {
        self.continuous.as_ref()
    }

    fn discrete(&self) -> Option<&[u32]> {
        self.discrete.as_deref()
    }
}

/// Several recordings sharing one auxiliary-variable schema.
#[derive(Debug, Clone)]
pub struct MultiSessionDataset {
    sessions: Vec<TensorDataset>,
}

impl MultiSessionDataset {
    pub fn new(sessions: Vec<TensorDataset>) -> Result<Self> {
        let Some(first) = sessions.first() else {
            return Err(CebraError::InvalidData(
                "multi-session dataset needs at least one session".to_string(),
            ));
        };
        let continuous_dim = first.continuous().map(ContinuousLabels::dim);
        let has_discrete = first.discrete().is_some();
        for (i, session) in sessions.iter().enumerate().skip(1) {
            let dim = session.continuous().map(ContinuousLabels::dim);
            if dim != continuous_dim {
                return Err(CebraError::InvalidData(format!(
                    "session {i} continuous labels {dim:?} do not match session 0 {continuous_dim:?}"
                )));
            }
            if session.discrete().is_some() != has_discrete {
                return Err(CebraError::InvalidData(format!(
                    "session {i} discrete labels do not match session 0"
                )));
            }
        }
        Ok(Self { sessions })
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, index: usize) -> Option<&TensorDataset> {
        self.sessions.get(index)
    }

    pub fn sessions(&self) -> &[TensorDataset] {
        &self.sessions
    }

    pub fn input_dimensions(&self) -> Vec<usize> {
        self.sessions.iter().map(Dataset::input_dimension).collect()
    }

    /// Move every session. Either all sessions move or none does.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        let moved = self
            .sessions
            .iter()
            .map(|s| s.neural.to_device(device))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (session, neural) in self.sessions.iter_mut().zip(moved) {
            session.neural = neural;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, c: usize) -> TensorDataset {
        let values: Vec<f32> = (0..n * c).map(|i| i as f32).collect();
        TensorDataset::from_vec(values, n, c, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_get_input_shape_and_values() {
        let ds = ramp(10, 2);
        let offset = Offset::new(1, 2);
        let windows = ds.get_input(&[1, 5], offset).unwrap();
        assert_eq!(windows.dims(), &[2, 2, 4]);
        let values = windows.to_vec3::<f32>().unwrap();
        // sample i, feature f has value 2*i + f
        assert_eq!(values[0][0], vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(values[0][1], vec![1.0, 3.0, 5.0, 7.0]);
        assert_eq!(values[1][0], vec![8.0, 10.0, 12.0, 14.0]);
    }

    #[test]
    fn test_get_input_rejects_out_of_range() {
        let ds = ramp(10, 2);
        let offset = Offset::new(1, 2);
        assert!(ds.get_input(&[0], offset).is_err());
        assert!(ds.get_input(&[8], offset).is_err());
        assert!(ds.get_input(&[7], offset).is_ok());
    }

    #[test]
    fn test_rejects_non_finite_signal() {
        let err = TensorDataset::from_vec(vec![1.0, f32::NAN], 2, 1, &Device::Cpu).unwrap_err();
        assert!(matches!(err, CebraError::InvalidData(_)));
    }

    #[test]
    fn test_label_length_checked() {
        let ds = ramp(4, 1);
        assert!(ds.clone().with_discrete(vec![0, 1, 0]).is_err());
        assert!(ds.clone().with_continuous(vec![0.0; 8], 2).is_ok());
        assert!(ds.with_continuous(vec![0.0; 6], 2).is_err());
    }

    #[test]
    fn test_multi_session_schema_must_match() {
        let a = ramp(5, 2).with_continuous(vec![0.0; 5], 1).unwrap();
        let b = ramp(6, 3).with_continuous(vec![0.0; 6], 1).unwrap();
        let c = ramp(6, 3).with_continuous(vec![0.0; 12], 2).unwrap();
        assert!(MultiSessionDataset::new(vec![a.clone(), b]).is_ok());
        assert!(MultiSessionDataset::new(vec![a, c]).is_err());
        assert!(MultiSessionDataset::new(vec![]).is_err());
    }
}
