use std::collections::BTreeMap;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use super::auxiliary::match_label;
use super::{uniform_indices, BatchIndex, Conditional};
use crate::data::{ContinuousLabels, Dataset, MultiSessionDataset, Offset};
use crate::error::{CebraError, Result};

/// Batch for one session. `reference` and `negative` index `session`,
/// `positive` indexes `positive_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBatchIndex {
    pub session: usize,
    pub positive_session: usize,
    pub batch: BatchIndex,
}

#[derive(Debug, Clone)]
enum Matching {
    Continuous {
        labels: Vec<ContinuousLabels>,
        tolerance: f32,
    },
    Discrete {
        labels: Vec<Vec<u32>>,
        by_label: Vec<BTreeMap<u32, Vec<usize>>>,
    },
    Time {
        time_offset: usize,
    },
}

/// Draws positives across sessions so that embeddings of different recordings align.
///
/// Each step picks a random non-zero cyclic shift; session `s` takes its
/// positives from session `(s + shift) % num_sessions`, matched by label.
/// Without labels, positives are time-contrastive within the same session.
#[derive(Debug, Clone)]
pub struct MultiSessionSampler {
    offset: Offset,
    valid: Vec<Range<usize>>,
    matching: Matching,
}

impl MultiSessionSampler {
    pub fn new(
        data: &MultiSessionDataset,
        offset: Offset,
        conditional: Conditional,
        time_offset: usize,
        tolerance: f32,
    ) -> Result<Self> {
        let sessions = data.sessions();
        let required = match conditional {
            Conditional::Time => time_offset + 1,
            _ => 1,
        };
        for session in sessions {
            offset.ensure_valid(session.len(), required)?;
        }
        let valid: Vec<Range<usize>> = sessions
            .iter()
            .map(|s| offset.valid_range(s.len()))
            .collect();

        let missing = |what: &str| {
            CebraError::InvalidConfig(format!(
                "{conditional} conditional needs {what} labels in every session"
            ))
        };
        let matching = match conditional {
            Conditional::Time => {
                if time_offset == 0 {
                    return Err(CebraError::InvalidConfig(
                        "time_offset must be at least 1".to_string(),
                    ));
                }
                Matching::Time { time_offset }
            }
            Conditional::Delta | Conditional::TimeDelta => {
                let labels = sessions
                    .iter()
                    .map(|s| s.continuous().cloned().ok_or_else(|| missing("continuous")))
                    .collect::<Result<Vec<_>>>()?;
                Matching::Continuous { labels, tolerance }
            }
            Conditional::Discrete => {
                let labels = sessions
                    .iter()
                    .map(|s| s.discrete().map(<[u32]>::to_vec).ok_or_else(|| missing("discrete")))
                    .collect::<Result<Vec<_>>>()?;
                let by_label = labels
                    .iter()
                    .zip(&valid)
                    .map(|(l, range)| {
                        let mut map: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
                        for i in range.clone() {
                            map.entry(l[i]).or_default().push(i);
                        }
                        map
                    })
                    .collect();
                Matching::Discrete { labels, by_label }
            }
        };
        Ok(Self {
            offset,
            valid,
            matching,
        })
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn num_sessions(&self) -> usize {
        self.valid.len()
    }

    pub fn sample(&self, rng: &mut StdRng, batch_size: usize) -> Result<Vec<SessionBatchIndex>> {
        let num_sessions = self.num_sessions();
        let shift = if num_sessions > 1 {
            rng.gen_range(1..num_sessions)
        } else {
            0
        };
        let mut out = Vec::with_capacity(num_sessions);
        let mut fallbacks = 0usize;
        for session in 0..num_sessions {
            let valid = self.valid[session].clone();
            let (positive_session, reference, positive) = match &self.matching {
                Matching::Time { time_offset } => {
                    let reference = uniform_indices(rng, valid.start..valid.end - time_offset, batch_size);
                    let positive = reference
                        .iter()
                        .map(|&r| r + rng.gen_range(1..=*time_offset))
                        .collect();
                    (session, reference, positive)
                }
                Matching::Continuous { labels, tolerance } => {
                    let partner = (session + shift) % num_sessions;
                    let exclude_self = partner == session;
                    let reference = uniform_indices(rng, valid.clone(), batch_size);
                    let mut positive = Vec::with_capacity(batch_size);
                    for &r in &reference {
                        let query = labels[session].row(r);
                        let exclude = exclude_self.then_some(r);
                        let (p, fallback) = match_label(
                            rng,
                            &labels[partner],
                            self.valid[partner].clone(),
                            exclude,
                            query,
                            *tolerance,
                        )
                        .ok_or_else(|| {
                            CebraError::Sampling(format!(
                                "session {partner} has no candidate for session {session} index {r}"
                            ))
                        })?;
                        fallbacks += usize::from(fallback);
                        positive.push(p);
                    }
                    (partner, reference, positive)
                }
                Matching::Discrete { labels, by_label } => {
                    let partner = (session + shift) % num_sessions;
                    let reference = uniform_indices(rng, valid.clone(), batch_size);
                    let mut positive = Vec::with_capacity(batch_size);
                    for &r in &reference {
                        let label = labels[session][r];
                        let members = by_label[partner].get(&label).ok_or_else(|| {
                            CebraError::Sampling(format!(
                                "session {partner} has no sample with label {label}"
                            ))
                        })?;
                        positive.push(members[rng.gen_range(0..members.len())]);
                    }
                    (partner, reference, positive)
                }
            };
            let negative = uniform_indices(rng, valid, batch_size);
            out.push(SessionBatchIndex {
                session,
                positive_session,
                batch: BatchIndex {
                    reference,
                    positive,
                    negative,
                },
            });
        }
        if fallbacks > 0 {
            debug!(fallbacks, "multi-session positives matched to nearest label");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDataset;
    use candle_core::Device;
    use rand::SeedableRng;

    fn session(n: usize, c: usize) -> TensorDataset {
        let labels: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
        TensorDataset::from_vec(vec![0.1; n * c], n, c, &Device::Cpu)
            .unwrap()
            .with_continuous(labels, 1)
            .unwrap()
    }

    #[test]
    fn test_positives_come_from_partner_session() {
        let data =
            MultiSessionDataset::new(vec![session(50, 6), session(80, 9), session(60, 3)]).unwrap();
        let offset = Offset::new(1, 1);
        let sampler =
            MultiSessionSampler::new(&data, offset, Conditional::Delta, 1, 0.05).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let batches = sampler.sample(&mut rng, 32).unwrap();
        assert_eq!(batches.len(), 3);
        let shift = (batches[0].positive_session + 3 - batches[0].session) % 3;
        assert_ne!(shift, 0);
        for b in &batches {
            assert_eq!(b.positive_session, (b.session + shift) % 3);
            let n_ref = data.sessions()[b.session].len();
            let n_pos = data.sessions()[b.positive_session].len();
            assert!(b.batch.reference.iter().all(|&i| offset.valid_range(n_ref).contains(&i)));
            assert!(b.batch.positive.iter().all(|&i| offset.valid_range(n_pos).contains(&i)));
            assert!(b.batch.negative.iter().all(|&i| offset.valid_range(n_ref).contains(&i)));
        }
    }

    #[test]
    fn test_discrete_label_missing_in_partner() {
        let a = session(10, 2).with_discrete(vec![0; 10]).unwrap();
        let b = session(10, 2).with_discrete(vec![1; 10]).unwrap();
        let data = MultiSessionDataset::new(vec![a, b]).unwrap();
        let sampler =
            MultiSessionSampler::new(&data, Offset::new(0, 0), Conditional::Discrete, 1, 0.0)
                .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sampler.sample(&mut rng, 4),
            Err(CebraError::Sampling(_))
        ));
    }

    #[test]
    fn test_missing_labels_rejected() {
        let plain = TensorDataset::from_vec(vec![0.0; 20], 10, 2, &Device::Cpu).unwrap();
        let data = MultiSessionDataset::new(vec![plain.clone(), plain]).unwrap();
        assert!(MultiSessionSampler::new(&data, Offset::new(0, 0), Conditional::Discrete, 1, 0.0)
            .is_err());
        assert!(MultiSessionSampler::new(&data, Offset::new(0, 0), Conditional::Time, 1, 0.0)
            .is_ok());
    }
}
