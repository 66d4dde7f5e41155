use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use super::encoders::ConvEncoder;
use super::params::ParamBuilder;
use crate::data::Offset;
use crate::error::{CebraError, Result};

/// A model mapping windowed input `[batch, num_input, time]` to embeddings
/// `[batch, num_output, time - offset().len() + 1]`.
pub trait Encoder: Send + Sync {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn offset(&self) -> Offset;

    fn num_input(&self) -> usize;

    fn num_output(&self) -> usize;

    /// Whether outputs lie on the unit hypersphere.
    fn normalize(&self) -> bool;

    fn num_parameters(&self) -> usize;

    /// Embeds windows of exactly `offset().len()` samples into `[batch, num_output]`.
    fn embed(&self, windows: &Tensor) -> Result<Tensor> {
        let out = self.forward(windows)?;
        let (batch, dim, time) = out.dims3()?;
        if time != 1 {
            return Err(CebraError::DimensionMismatch {
                expected: 1,
                actual: time,
            });
        }
        Ok(out.reshape((batch, dim))?)
    }
}

/// Built-in encoder architectures, addressed by name in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Offset10,
    Offset10Mse,
    Offset5,
    Offset1V2,
    Offset1,
    Offset1Mse,
}

impl Architecture {
    pub const ALL: [Architecture; 6] = [
        Self::Offset10,
        Self::Offset10Mse,
        Self::Offset5,
        Self::Offset1V2,
        Self::Offset1,
        Self::Offset1Mse,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Offset10 => "offset10-model",
            Self::Offset10Mse => "offset10-model-mse",
            Self::Offset5 => "offset5-model",
            Self::Offset1V2 => "offset1-model-v2",
            Self::Offset1 => "offset1-model",
            Self::Offset1Mse => "offset1-model-mse",
        }
    }

    pub fn offset(&self) -> Offset {
        match self {
            Self::Offset10 | Self::Offset10Mse => Offset::new(5, 4),
            Self::Offset5 => Offset::new(2, 2),
            Self::Offset1V2 => Offset::new(0, 1),
            Self::Offset1 | Self::Offset1Mse => Offset::new(0, 0),
        }
    }

    /// `-mse` variants skip the hypersphere projection.
    pub fn normalize(&self) -> bool {
        !matches!(self, Self::Offset10Mse | Self::Offset1Mse)
    }

    pub fn min_hidden_units(&self) -> usize {
        match self {
            Self::Offset1 | Self::Offset1Mse => 1,
            _ => 2,
        }
    }

    pub fn build(
        &self,
        params: &mut ParamBuilder<'_>,
        num_input: usize,
        num_units: usize,
        num_output: usize,
    ) -> Result<ConvEncoder> {
        ConvEncoder::new(params, *self, num_input, num_units, num_output)
    }
}

/// Registry names sharing a layout with a canonical architecture.
const ALIASES: [(&str, Architecture); 3] = [
    ("offset1-model-v3", Architecture::Offset1V2),
    ("offset1-model-v4", Architecture::Offset1V2),
    ("offset1-model-v5", Architecture::Offset1V2),
];

impl FromStr for Architecture {
    type Err = CebraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|arch| arch.name() == s)
            .or_else(|| ALIASES.iter().find(|(name, _)| *name == s).map(|(_, arch)| *arch))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|a| a.name()).collect();
                CebraError::InvalidConfig(format!(
                    "unknown model architecture '{s}', expected one of {}",
                    known.join(", ")
                ))
            })
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(arch: Architecture, num_input: usize) -> (VarMap, ConvEncoder) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(0);
        let encoder = {
            let mut params = ParamBuilder::new(&varmap, &mut rng, &device);
            arch.build(&mut params, num_input, 16, 4).unwrap()
        };
        (varmap, encoder)
    }

    #[test]
    fn test_names_round_trip() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
        let err = "offset3-model".parse::<Architecture>().unwrap_err();
        assert!(err.to_string().contains("offset10-model"));
    }

    #[test]
    fn test_single_step_variants_share_a_layout() {
        for name in ["offset1-model-v2", "offset1-model-v3", "offset1-model-v4", "offset1-model-v5"] {
            let arch: Architecture = name.parse().unwrap();
            assert_eq!(arch, Architecture::Offset1V2);
            assert_eq!(arch.offset(), Offset::new(0, 1));
        }
        assert!("offset2-model".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_layer_stack_matches_declared_offset() {
        for arch in Architecture::ALL {
            let (_, encoder) = build(arch, 3);
            assert_eq!(
                encoder.receptive_shrink(),
                arch.offset().len() - 1,
                "{arch}"
            );
        }
    }

    #[test]
    fn test_output_length_follows_offset() {
        let device = Device::Cpu;
        for arch in Architecture::ALL {
            let (_, encoder) = build(arch, 3);
            let xs = Tensor::randn(0f32, 1.0, (2, 3, 20), &device).unwrap();
            let out = encoder.forward(&xs).unwrap();
            assert_eq!(out.dims(), &[2, 4, 20 - arch.offset().len() + 1], "{arch}");
        }
    }

    #[test]
    fn test_normalized_outputs_have_unit_norm() {
        let device = Device::Cpu;
        let (_, encoder) = build(Architecture::Offset5, 3);
        let xs = Tensor::randn(0f32, 1.0, (6, 3, 5), &device).unwrap();
        let emb = encoder.embed(&xs).unwrap();
        let norms = emb.sqr().unwrap().sum(1).unwrap().sqrt().unwrap();
        for n in norms.to_vec1::<f32>().unwrap() {
            assert!((n - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_wrong_input_dimension_is_rejected() {
        let (_, encoder) = build(Architecture::Offset1, 3);
        let xs = Tensor::zeros((1, 5, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            encoder.forward(&xs),
            Err(CebraError::DimensionMismatch {
                expected: 3,
                actual: 5
            })
        ));
    }

    #[test]
    fn test_parameter_count_matches_varmap() {
        let (varmap, encoder) = build(Architecture::Offset10, 7);
        assert_eq!(
            encoder.num_parameters(),
            crate::model::params::count_parameters(&varmap).unwrap()
        );
    }
}
