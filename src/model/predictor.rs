use candle_core::{Module, Tensor};
use candle_nn::Linear;

use super::params::ParamBuilder;
use crate::error::Result;

/// Readout on top of encoder features: ReLU then a linear map to the targets.
pub struct Predictor {
    fc: Linear,
    num_targets: usize,
}

impl Predictor {
    pub fn new(params: &mut ParamBuilder<'_>, num_features: usize, num_targets: usize) -> Result<Self> {
        let fc = params.pp("fc").linear(num_features, num_targets)?;
        Ok(Self { fc, num_targets })
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    /// `[batch, num_features]` -> `[batch, num_targets]`
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        Ok(self.fc.forward(&features.relu()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(3);
        let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
        let head = Predictor::new(&mut params.pp("head"), 8, 3).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (5, 8), &device).unwrap();
        assert_eq!(head.forward(&xs).unwrap().dims(), &[5, 3]);
        assert_eq!(head.num_targets(), 3);
    }
}
