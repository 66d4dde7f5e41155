//! Contrastive losses over `[batch, dim]` reference, positive and negative embeddings.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{CebraError, Result};
use crate::model::ParamBuilder;

/// Parameter name of the learnable temperature, relative to the criterion scope.
pub const LOG_INVERSE_TEMPERATURE: &str = "log_inverse_temperature";

/// Loss plus its two diagnostic components. `loss` stays on the autodiff graph.
pub struct LossOutput {
    pub loss: Tensor,
    pub alignment: Tensor,
    pub uniformity: Tensor,
}

pub trait Criterion: Send + Sync {
    fn compute(&self, reference: &Tensor, positive: &Tensor, negative: &Tensor) -> Result<LossOutput>;

    /// Current temperature; `None` for criteria without one.
    fn temperature(&self) -> Result<Option<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    /// Dot product, the cosine similarity for normalized embeddings.
    Cosine,
    /// Negative squared euclidean distance.
    Euclidean,
}

impl FromStr for Distance {
    type Err = CebraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "euclidean" => Ok(Self::Euclidean),
            other => Err(CebraError::InvalidConfig(format!(
                "unknown distance '{other}', expected cosine or euclidean"
            ))),
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temperature {
    Constant(f32),
    /// Learned during training, never below `min`.
    Auto { initial: f32, min: f32 },
}

enum InverseTemperature {
    Fixed(f64),
    Learnable { log_inv: Tensor, max_inv: f64 },
}

impl InverseTemperature {
    fn value(&self) -> Result<Tensor> {
        match self {
            Self::Fixed(_) => Err(CebraError::InvalidConfig(
                "fixed temperature has no tensor value".to_string(),
            )),
            Self::Learnable { log_inv, max_inv } => {
                Ok(log_inv.exp()?.clamp(0f64, *max_inv)?)
            }
        }
    }

    fn scale(&self, scores: &Tensor) -> Result<Tensor> {
        match self {
            Self::Fixed(inv) => Ok(scores.affine(*inv, 0.0)?),
            Self::Learnable { .. } => Ok(scores.broadcast_mul(&self.value()?)?),
        }
    }
}

/// InfoNCE: for each reference, the positive competes against every
/// negative in the batch.
///
/// `loss_i = logsumexp(s(r_i, p_i), s(r_i, n_1), .., s(r_i, n_B)) - s(r_i, p_i)`
/// with scores scaled by the inverse temperature. `alignment` is the mean of
/// `-s(r_i, p_i)`, `uniformity` the mean of the logsumexp term; their sum is the loss.
pub struct InfoNce {
    distance: Distance,
    inverse_temperature: InverseTemperature,
}

impl InfoNce {
    pub fn new(params: &mut ParamBuilder<'_>, distance: Distance, temperature: Temperature) -> Result<Self> {
        let inverse_temperature = match temperature {
            Temperature::Constant(t) => {
                check_temperature("temperature", t)?;
                InverseTemperature::Fixed(1.0 / t as f64)
            }
            Temperature::Auto { initial, min } => {
                check_temperature("temperature", initial)?;
                check_temperature("min_temperature", min)?;
                if initial < min {
                    return Err(CebraError::InvalidConfig(format!(
                        "initial temperature {initial} is below min_temperature {min}"
                    )));
                }
                let log_inv = params.constant(LOG_INVERSE_TEMPERATURE, &[1], -initial.ln())?;
                InverseTemperature::Learnable {
                    log_inv,
                    max_inv: 1.0 / min as f64,
                }
            }
        };
        Ok(Self {
            distance,
            inverse_temperature,
        })
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    /// Scores of each reference against its positive `[B]` and against all negatives `[B, B]`.
    fn scores(&self, reference: &Tensor, positive: &Tensor, negative: &Tensor) -> Result<(Tensor, Tensor)> {
        let dot_pos = (reference * positive)?.sum(D::Minus1)?;
        let dot_neg = reference.matmul(&negative.t()?)?;
        let (pos, neg) = match self.distance {
            Distance::Cosine => (dot_pos, dot_neg),
            Distance::Euclidean => {
                let ref_sq = reference.sqr()?.sum_keepdim(D::Minus1)?;
                let pos_sq = positive.sqr()?.sum(D::Minus1)?;
                let neg_sq = negative.sqr()?.sum(D::Minus1)?.unsqueeze(0)?;
                let pos = dot_pos
                    .affine(2.0, 0.0)?
                    .sub(&ref_sq.squeeze(D::Minus1)?)?
                    .sub(&pos_sq)?;
                let neg = dot_neg
                    .affine(2.0, 0.0)?
                    .broadcast_sub(&ref_sq)?
                    .broadcast_sub(&neg_sq)?;
                (pos, neg)
            }
        };
        Ok((
            self.inverse_temperature.scale(&pos)?,
            self.inverse_temperature.scale(&neg)?,
        ))
    }
}

fn check_temperature(name: &str, value: f32) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(CebraError::InvalidConfig(format!(
            "{name} must be positive and finite, got {value}"
        )));
    }
    Ok(())
}

/// Row-wise `log(sum(exp(x)))` over the last axis, shifted by the detached row max.
pub fn logsumexp(xs: &Tensor) -> Result<Tensor> {
    let max = xs.max_keepdim(D::Minus1)?.detach();
    let shifted = xs.broadcast_sub(&max)?;
    let lse = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok((lse + max)?.squeeze(D::Minus1)?)
}

fn check_batch(reference: &Tensor, positive: &Tensor, negative: &Tensor) -> Result<()> {
    let (b, d) = reference.dims2()?;
    for t in [positive, negative] {
        let (bt, dt) = t.dims2()?;
        if bt != b {
            return Err(CebraError::DimensionMismatch { expected: b, actual: bt });
        }
        if dt != d {
            return Err(CebraError::DimensionMismatch { expected: d, actual: dt });
        }
    }
    Ok(())
}

impl Criterion for InfoNce {
    fn compute(&self, reference: &Tensor, positive: &Tensor, negative: &Tensor) -> Result<LossOutput> {
        check_batch(reference, positive, negative)?;
        let (pos, neg) = self.scores(reference, positive, negative)?;
        let all = Tensor::cat(&[&pos.unsqueeze(1)?, &neg], 1)?;
        let lse = logsumexp(&all)?;
        let alignment = pos.neg()?.mean_all()?;
        let uniformity = lse.mean_all()?;
        let loss = (&alignment + &uniformity)?;
        Ok(LossOutput {
            loss,
            alignment,
            uniformity,
        })
    }

    fn temperature(&self) -> Result<Option<f32>> {
        let t = match &self.inverse_temperature {
            InverseTemperature::Fixed(inv) => (1.0 / inv) as f32,
            InverseTemperature::Learnable { .. } => {
                let inv = self
                    .inverse_temperature
                    .value()?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?;
                1.0 / inv
            }
        };
        Ok(Some(t))
    }
}

/// Squared distance between reference and positive, with an optional hinge
/// pushing negatives beyond `margin`.
pub struct Mse {
    margin: f32,
}

impl Mse {
    pub fn new(margin: f32) -> Result<Self> {
        if !(margin.is_finite() && margin >= 0.0) {
            return Err(CebraError::InvalidConfig(format!(
                "mse margin must be finite and non-negative, got {margin}"
            )));
        }
        Ok(Self { margin })
    }
}

impl Criterion for Mse {
    fn compute(&self, reference: &Tensor, positive: &Tensor, negative: &Tensor) -> Result<LossOutput> {
        check_batch(reference, positive, negative)?;
        let alignment = (reference - positive)?.sqr()?.sum(D::Minus1)?.mean_all()?;
        let uniformity = if self.margin > 0.0 {
            let neg_sq = (reference - negative)?.sqr()?.sum(D::Minus1)?;
            neg_sq
                .affine(-1.0, self.margin as f64)?
                .relu()?
                .mean_all()?
        } else {
            alignment.zeros_like()?
        };
        let loss = (&alignment + &uniformity)?;
        Ok(LossOutput {
            loss,
            alignment,
            uniformity,
        })
    }

    fn temperature(&self) -> Result<Option<f32>> {
        Ok(None)
    }
}
