use candle_core::{Module, Tensor};
use candle_nn::Conv1d;

use crate::data::Offset;
use crate::error::{CebraError, Result};
use crate::model::encoder::{Architecture, Encoder};
use crate::model::params::ParamBuilder;

enum Layer {
    Conv(Conv1d),
    Gelu,
    /// Kernel-3 convolution + GELU added to the input cropped by one sample per side.
    Skip(Conv1d),
}

impl Layer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Conv(conv) => conv.forward(xs)?,
            Self::Gelu => xs.gelu()?,
            Self::Skip(conv) => {
                let t = xs.dim(2)?;
                let residual = xs.narrow(2, 1, t - 2)?;
                (residual + conv.forward(xs)?.gelu()?)?
            }
        };
        Ok(out)
    }

    fn num_parameters(&self) -> usize {
        match self {
            Self::Conv(conv) | Self::Skip(conv) => {
                conv.weight().elem_count() + conv.bias().map_or(0, |b| b.elem_count())
            }
            Self::Gelu => 0,
        }
    }

    /// Samples removed from the time axis by this layer.
    fn shrink(&self) -> usize {
        match self {
            Self::Conv(conv) => conv.weight().dims()[2] - 1,
            Self::Skip(_) => 2,
            Self::Gelu => 0,
        }
    }
}

/// Stack of temporal convolutions shared by every built-in architecture.
///
/// Input `[batch, num_input, time]`, output `[batch, num_output, time - offset.len() + 1]`,
/// optionally projected onto the unit hypersphere along the feature axis.
pub struct ConvEncoder {
    architecture: Architecture,
    layers: Vec<Layer>,
    offset: Offset,
    normalize: bool,
    num_input: usize,
    num_output: usize,
}

impl ConvEncoder {
    pub(crate) fn new(
        params: &mut ParamBuilder<'_>,
        architecture: Architecture,
        num_input: usize,
        num_units: usize,
        num_output: usize,
    ) -> Result<Self> {
        if num_input < 1 {
            return Err(CebraError::InvalidConfig(format!(
                "input dimension needs to be at least 1, got {num_input}"
            )));
        }
        if num_output < 1 {
            return Err(CebraError::InvalidConfig(format!(
                "output dimension needs to be at least 1, got {num_output}"
            )));
        }
        let min_units = architecture.min_hidden_units();
        if num_units < min_units {
            return Err(CebraError::InvalidConfig(format!(
                "{} needs at least {min_units} hidden units, got {num_units}",
                architecture.name()
            )));
        }

        let mut layers = Vec::new();
        let mut idx = 0usize;
        let mut conv = |params: &mut ParamBuilder<'_>, i: usize, o: usize, k: usize| {
            let layer = params.pp(format!("layer_{idx}")).conv1d(i, o, k);
            idx += 1;
            layer
        };
        let h = num_units;
        match architecture {
            Architecture::Offset10 | Architecture::Offset10Mse => {
                layers.push(Layer::Conv(conv(params, num_input, h, 2)?));
                layers.push(Layer::Gelu);
                for _ in 0..3 {
                    layers.push(Layer::Skip(conv(params, h, h, 3)?));
                }
                layers.push(Layer::Conv(conv(params, h, num_output, 3)?));
            }
            Architecture::Offset5 => {
                layers.push(Layer::Conv(conv(params, num_input, h, 2)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Skip(conv(params, h, h, 3)?));
                layers.push(Layer::Conv(conv(params, h, num_output, 2)?));
            }
            Architecture::Offset1V2 => {
                layers.push(Layer::Conv(conv(params, num_input, h, 2)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Conv(conv(params, h, h, 1)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Conv(conv(params, h, num_output, 1)?));
            }
            Architecture::Offset1 | Architecture::Offset1Mse => {
                layers.push(Layer::Conv(conv(params, num_input, h, 1)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Conv(conv(params, h, h, 1)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Conv(conv(params, h, h, 1)?));
                layers.push(Layer::Gelu);
                layers.push(Layer::Conv(conv(params, h, num_output, 1)?));
            }
        }

        Ok(Self {
            architecture,
            layers,
            offset: architecture.offset(),
            normalize: architecture.normalize(),
            num_input,
            num_output,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Receptive field implied by the layer stack, `offset.len() - 1` for a consistent model.
    pub fn receptive_shrink(&self) -> usize {
        self.layers.iter().map(Layer::shrink).sum()
    }
}

impl Encoder for ConvEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, channels, time) = xs.dims3()?;
        if channels != self.num_input {
            return Err(CebraError::DimensionMismatch {
                expected: self.num_input,
                actual: channels,
            });
        }
        if time < self.offset.len() {
            return Err(CebraError::InsufficientSamples {
                required: self.offset.len(),
                available: time,
            });
        }
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        if self.normalize {
            let norm = h.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-8, 1e10)?;
            h = h.broadcast_div(&norm)?;
        }
        Ok(h)
    }

    fn offset(&self) -> Offset {
        self.offset
    }

    fn num_input(&self) -> usize {
        self.num_input
    }

    fn num_output(&self) -> usize {
        self.num_output
    }

    fn normalize(&self) -> bool {
        self.normalize
    }

    fn num_parameters(&self) -> usize {
        self.layers.iter().map(Layer::num_parameters).sum()
    }
}
