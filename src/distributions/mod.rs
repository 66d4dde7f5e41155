//! Index sampling for contrastive learning.
//!
//! A sampler draws `(reference, positive, negative)` center indices; the
//! solver then extracts the matching windows from the dataset. All draws come
//! from an RNG derived from `(seed, step)`, so a resumed run sees the same
//! batches as an uninterrupted one.

mod auxiliary;
mod multi_session;
mod time_contrastive;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::Offset;
use crate::error::{CebraError, Result};

pub use auxiliary::{ContinuousSampler, DiscreteSampler, Perturbation};
pub use multi_session::{MultiSessionSampler, SessionBatchIndex};
pub use time_contrastive::TimeContrastiveSampler;

/// Center indices for one contrastive batch. All three vectors have the batch length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchIndex {
    pub reference: Vec<usize>,
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
}

impl BatchIndex {
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

pub trait Sampler {
    fn sample(&self, rng: &mut StdRng, batch_size: usize) -> Result<BatchIndex>;

    fn offset(&self) -> Offset;
}

/// How positive pairs are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conditional {
    /// Positives are nearby in time.
    Time,
    /// Positives match the reference label shifted by an observed label change.
    TimeDelta,
    /// Positives match the reference label plus Gaussian noise.
    Delta,
    /// Positives share the reference's discrete label.
    Discrete,
}

impl Conditional {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::TimeDelta => "time_delta",
            Self::Delta => "delta",
            Self::Discrete => "discrete",
        }
    }

    pub fn needs_continuous(&self) -> bool {
        matches!(self, Self::TimeDelta | Self::Delta)
    }
}

impl FromStr for Conditional {
    type Err = CebraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "time" => Ok(Self::Time),
            "time_delta" => Ok(Self::TimeDelta),
            "delta" => Ok(Self::Delta),
            "discrete" => Ok(Self::Discrete),
            other => Err(CebraError::InvalidConfig(format!(
                "unknown conditional '{other}', expected time, time_delta, delta or discrete"
            ))),
        }
    }
}

impl fmt::Display for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// RNG for one training step.
pub fn step_rng(seed: u64, step: usize) -> StdRng {
    StdRng::seed_from_u64(splitmix64(seed ^ splitmix64(step as u64)))
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// `count` indices drawn uniformly with replacement from `range`.
pub fn uniform_indices(rng: &mut StdRng, range: Range<usize>, count: usize) -> Vec<usize> {
    (0..count).map(|_| rng.gen_range(range.clone())).collect()
}
