use std::ops::Range;

use rand::rngs::StdRng;
use rand::Rng;

use super::{uniform_indices, BatchIndex, Sampler};
use crate::data::{Dataset, Offset};
use crate::error::{CebraError, Result};

/// Positives are the reference shifted forward by `1..=time_offset` samples.
#[derive(Debug, Clone)]
pub struct TimeContrastiveSampler {
    offset: Offset,
    valid: Range<usize>,
    time_offset: usize,
}

impl TimeContrastiveSampler {
    pub fn new(dataset: &dyn Dataset, offset: Offset, time_offset: usize) -> Result<Self> {
        if time_offset == 0 {
            return Err(CebraError::InvalidConfig(
                "time_offset must be at least 1".to_string(),
            ));
        }
        offset.ensure_valid(dataset.len(), time_offset + 1)?;
        Ok(Self {
            offset,
            valid: offset.valid_range(dataset.len()),
            time_offset,
        })
    }
}

impl Sampler for TimeContrastiveSampler {
    fn sample(&self, rng: &mut StdRng, batch_size: usize) -> Result<BatchIndex> {
        let reference = uniform_indices(
            rng,
            self.valid.start..self.valid.end - self.time_offset,
            batch_size,
        );
        let positive = reference
            .iter()
            .map(|&r| r + rng.gen_range(1..=self.time_offset))
            .collect();
        let negative = uniform_indices(rng, self.valid.clone(), batch_size);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDataset;
    use candle_core::Device;
    use rand::SeedableRng;

    fn dataset(n: usize) -> TensorDataset {
        TensorDataset::from_vec(vec![0.5; n * 2], n, 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_indices_respect_margins() {
        let ds = dataset(40);
        let offset = Offset::new(3, 2);
        let sampler = TimeContrastiveSampler::new(&ds, offset, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = sampler.sample(&mut rng, 256).unwrap();
        assert_eq!(batch.len(), 256);
        let valid = offset.valid_range(40);
        for i in 0..batch.len() {
            let (r, p) = (batch.reference[i], batch.positive[i]);
            assert!(valid.contains(&r) && valid.contains(&p));
            assert!(valid.contains(&batch.negative[i]));
            assert!(p > r && p - r <= 4);
        }
    }

    #[test]
    fn test_short_dataset_fails_at_construction() {
        let ds = dataset(5);
        let err = TimeContrastiveSampler::new(&ds, Offset::new(5, 5), 1).unwrap_err();
        assert!(matches!(err, CebraError::InsufficientSamples { .. }));
    }
}
