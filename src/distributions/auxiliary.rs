//! Samplers conditioned on auxiliary variables.

use std::collections::BTreeMap;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use super::{uniform_indices, BatchIndex, Sampler};
use crate::data::{ContinuousLabels, Dataset, Offset};
use crate::error::{CebraError, Result};

const NEGATIVE_ATTEMPTS: usize = 16;

/// Positives share the reference's label, negatives carry a different one.
/// References are drawn class-balanced: class first, then a member.
#[derive(Debug, Clone)]
pub struct DiscreteSampler {
    offset: Offset,
    classes: Vec<Vec<usize>>,
    num_valid: usize,
}

impl DiscreteSampler {
    pub fn new(dataset: &dyn Dataset, offset: Offset) -> Result<Self> {
        let labels = dataset.discrete().ok_or_else(|| {
            CebraError::InvalidConfig(
                "discrete conditional needs a dataset with discrete labels".to_string(),
            )
        })?;
        offset.ensure_valid(dataset.len(), 2)?;
        let valid = offset.valid_range(dataset.len());
        let mut by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for i in valid.clone() {
            by_label.entry(labels[i]).or_default().push(i);
        }
        if by_label.len() < 2 {
            return Err(CebraError::Sampling(format!(
                "discrete sampling needs at least two classes in the valid range, found {}",
                by_label.len()
            )));
        }
        Ok(Self {
            offset,
            classes: by_label.into_values().collect(),
            num_valid: valid.len(),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn negative(&self, rng: &mut StdRng, class: usize) -> usize {
        let mut k = rng.gen_range(0..self.num_valid - self.classes[class].len());
        for (c, members) in self.classes.iter().enumerate() {
            if c == class {
                continue;
            }
            if k < members.len() {
                return members[k];
            }
            k -= members.len();
        }
        // k < num_valid - len(class), so the loop always returns
        self.classes[(class + 1) % self.classes.len()][0]
    }
}

impl Sampler for DiscreteSampler {
    fn sample(&self, rng: &mut StdRng, batch_size: usize) -> Result<BatchIndex> {
        let mut batch = BatchIndex {
            reference: Vec::with_capacity(batch_size),
            positive: Vec::with_capacity(batch_size),
            negative: Vec::with_capacity(batch_size),
        };
        for _ in 0..batch_size {
            let class = rng.gen_range(0..self.classes.len());
            let members = &self.classes[class];
            let at = rng.gen_range(0..members.len());
            let positive = if members.len() == 1 {
                members[at]
            } else {
                let k = rng.gen_range(0..members.len() - 1);
                members[if k >= at { k + 1 } else { k }]
            };
            batch.reference.push(members[at]);
            batch.positive.push(positive);
            batch.negative.push(self.negative(rng, class));
        }
        Ok(batch)
    }

    fn offset(&self) -> Offset {
        self.offset
    }
}

/// How the query label for a positive is derived from the reference label.
#[derive(Debug, Clone, Copy)]
pub enum Perturbation {
    /// Add isotropic Gaussian noise with this standard deviation.
    Gaussian { std: f32 },
    /// Add the label change observed between two samples `lag` apart.
    Empirical { lag: usize },
}

/// Positives are samples whose continuous label lies close to a perturbed
/// copy of the reference label.
///
/// A candidate qualifies when its label is within `tolerance` of the query.
/// When none does, the nearest candidate is used instead and counted as a
/// fallback; the count is logged at debug level.
#[derive(Debug, Clone)]
pub struct ContinuousSampler {
    offset: Offset,
    valid: Range<usize>,
    labels: ContinuousLabels,
    perturbation: Perturbation,
    noise: Option<Normal<f32>>,
    tolerance: f32,
}

impl ContinuousSampler {
    pub fn new(
        dataset: &dyn Dataset,
        offset: Offset,
        perturbation: Perturbation,
        tolerance: f32,
    ) -> Result<Self> {
        let labels = dataset.continuous().ok_or_else(|| {
            CebraError::InvalidConfig(
                "continuous conditional needs a dataset with continuous labels".to_string(),
            )
        })?;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(CebraError::InvalidConfig(format!(
                "tolerance must be finite and non-negative, got {tolerance}"
            )));
        }
        offset.ensure_valid(dataset.len(), 2)?;
        let noise = match perturbation {
            Perturbation::Gaussian { std } => Some(Normal::new(0.0, std).map_err(|e| {
                CebraError::InvalidConfig(format!("invalid delta {std}: {e}"))
            })?),
            Perturbation::Empirical { lag } => {
                if lag == 0 || lag >= dataset.len() {
                    return Err(CebraError::InsufficientSamples {
                        required: lag.max(1) + 1,
                        available: dataset.len(),
                    });
                }
                None
            }
        };
        Ok(Self {
            offset,
            valid: offset.valid_range(dataset.len()),
            labels: labels.clone(),
            perturbation,
            noise,
            tolerance,
        })
    }

    fn query(&self, rng: &mut StdRng, reference: usize) -> Vec<f32> {
        let mut query = self.labels.row(reference).to_vec();
        match (self.perturbation, &self.noise) {
            (Perturbation::Gaussian { .. }, Some(noise)) => {
                for q in query.iter_mut() {
                    *q += noise.sample(rng);
                }
            }
            (Perturbation::Empirical { lag }, _) => {
                let j = rng.gen_range(0..self.labels.len() - lag);
                let (from, to) = (self.labels.row(j), self.labels.row(j + lag));
                for (q, (a, b)) in query.iter_mut().zip(from.iter().zip(to)) {
                    *q += b - a;
                }
            }
            (Perturbation::Gaussian { .. }, None) => {}
        }
        query
    }
}

/// Uniform choice among candidates within `tolerance` of `query`, or the
/// nearest candidate when none qualifies. The flag is `true` for a fallback.
pub(super) fn match_label(
    rng: &mut StdRng,
    labels: &ContinuousLabels,
    candidates: Range<usize>,
    exclude: Option<usize>,
    query: &[f32],
    tolerance: f32,
) -> Option<(usize, bool)> {
    let tol_sq = tolerance * tolerance;
    let mut matched = None;
    let mut num_matched = 0usize;
    let mut nearest: Option<(usize, f32)> = None;
    for i in candidates {
        if Some(i) == exclude {
            continue;
        }
        let d = labels.sq_distance(i, query);
        if d <= tol_sq {
            num_matched += 1;
            if rng.gen_range(0..num_matched) == 0 {
                matched = Some(i);
            }
        }
        if nearest.map_or(true, |(_, best)| d < best) {
            nearest = Some((i, d));
        }
    }
    match matched {
        Some(i) => Some((i, false)),
        None => nearest.map(|(i, _)| (i, true)),
    }
}

impl Sampler for ContinuousSampler {
    fn sample(&self, rng: &mut StdRng, batch_size: usize) -> Result<BatchIndex> {
        let reference = uniform_indices(rng, self.valid.clone(), batch_size);
        let mut positive = Vec::with_capacity(batch_size);
        let mut negative = Vec::with_capacity(batch_size);
        let mut fallbacks = 0usize;
        let tol_sq = self.tolerance * self.tolerance;

        for &r in &reference {
            let query = self.query(rng, r);
            let (p, fallback) =
                match_label(rng, &self.labels, self.valid.clone(), Some(r), &query, self.tolerance)
                    .ok_or_else(|| {
                        CebraError::Sampling(format!("no positive candidate for reference {r}"))
                    })?;
            fallbacks += usize::from(fallback);
            positive.push(p);

            let anchor = self.labels.row(r);
            let mut farthest = (r, f32::NEG_INFINITY);
            let mut chosen = None;
            for _ in 0..NEGATIVE_ATTEMPTS {
                let n = rng.gen_range(self.valid.clone());
                let d = self.labels.sq_distance(n, anchor);
                if d > tol_sq {
                    chosen = Some(n);
                    break;
                }
                if d > farthest.1 {
                    farthest = (n, d);
                }
            }
            negative.push(chosen.unwrap_or(farthest.0));
        }

        if fallbacks > 0 {
            debug!(
                fallbacks,
                batch_size, "no positive within tolerance, used nearest label instead"
            );
        }
        Ok(BatchIndex {
            reference,
            positive,
            negative,
        })
    }

    fn offset(&self) -> Offset {
        self.offset
    }
}
