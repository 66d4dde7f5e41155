use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use tracing::info;

use super::checkpoint::{Checkpoint, CheckpointState, LabelSchema, SolverKind, OPTIMIZER_PREFIX};
use super::single_session::{build_criterion, build_encoder, embed_signal};
use super::{
    format_params, train_loop, Assembled, FitOutcome, History, Phase, Restore, Solver, SolverCore,
    StopHandle, Trainable, ENCODER_PREFIX,
};
use crate::config::SolverConfig;
use crate::criterion::Criterion;
use crate::data::{Dataset, MultiSessionDataset, Offset};
use crate::distributions::MultiSessionSampler;
use crate::error::{CebraError, Result};
use crate::model::Encoder;

struct MultiSessionModel {
    /// One encoder per session, or a single shared one.
    encoders: Vec<Box<dyn Encoder>>,
    criterion: Box<dyn Criterion>,
    input_dims: Vec<usize>,
}

impl MultiSessionModel {
    fn encoder(&self, session: usize) -> &dyn Encoder {
        let i = if self.encoders.len() == 1 { 0 } else { session };
        self.encoders[i].as_ref()
    }

    fn num_parameters(&self) -> usize {
        self.encoders.iter().map(|e| e.num_parameters()).sum()
    }
}

/// Contrastive solver aligning several recordings in one embedding space.
///
/// Every session gets its own encoder (unless `share_encoder` is set), all with
/// the same output dimension. Each step embeds one batch per session and
/// evaluates the criterion once over all rows, so every session's references
/// compete against the pooled negatives; the loss is the session average.
pub struct MultiSessionSolver {
    core: SolverCore,
    model: Option<MultiSessionModel>,
}

impl MultiSessionSolver {
    pub fn new(config: SolverConfig) -> Result<Self> {
        Ok(Self {
            core: SolverCore::new(config)?,
            model: None,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.core.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.core.stop.clone()
    }

    pub fn num_sessions(&self) -> Option<usize> {
        self.model.as_ref().map(|m| m.input_dims.len())
    }

    pub fn offset(&self) -> Option<Offset> {
        self.model.as_ref().map(|m| m.encoders[0].offset())
    }

    pub fn fit_with_batch_size(
        &mut self,
        data: &MultiSessionDataset,
        num_steps: usize,
        batch_size: usize,
    ) -> Result<FitOutcome> {
        if batch_size == 0 {
            return Err(CebraError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        let offset = self.planned_offset(&data.input_dimensions())?;
        let config = &self.core.config;
        let sampler =
            MultiSessionSampler::new(data, offset, config.conditional, config.time_offset, config.delta)?;
        self.prepare(&data.input_dimensions())?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        let config = &self.core.config;
        info!(
            "fit: {} steps from step {} | model {} x{} ({} params) | {} sessions | conditional {} | batch {} per session",
            num_steps,
            self.core.step,
            config.model,
            model.encoders.len(),
            format_params(model.num_parameters()),
            data.num_sessions(),
            config.conditional,
            batch_size
        );
        if let Some(first) = data.session(0) {
            self.core.labels = LabelSchema::of(first);
        }

        train_loop(self, num_steps, |solver: &Self, rng: &mut StdRng| {
            let model = solver.model.as_ref().ok_or(CebraError::NotFitted)?;
            let device = &solver.core.device;
            let mut refs = Vec::new();
            let mut poss = Vec::new();
            let mut negs = Vec::new();
            for sb in sampler.sample(rng, batch_size)? {
                let session = &data.sessions()[sb.session];
                let partner = &data.sessions()[sb.positive_session];
                let encoder = model.encoder(sb.session);
                let own = [sb.batch.reference.as_slice(), sb.batch.negative.as_slice()].concat();
                let windows = session.get_input(&own, offset)?.to_device(device)?;
                let emb = encoder.embed(&windows)?;
                refs.push(emb.narrow(0, 0, batch_size)?);
                negs.push(emb.narrow(0, batch_size, batch_size)?);
                let windows = partner.get_input(&sb.batch.positive, offset)?.to_device(device)?;
                poss.push(model.encoder(sb.positive_session).embed(&windows)?);
            }
            let r = Tensor::cat(&refs, 0)?;
            let p = Tensor::cat(&poss, 0)?;
            let n = Tensor::cat(&negs, 0)?;
            model.criterion.compute(&r, &p, &n)
        })
    }

    /// Embeds one session with its encoder.
    pub fn transform_session(&self, data: &MultiSessionDataset, session: usize) -> Result<Tensor> {
        self.core.ensure_fitted()?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        if session >= model.input_dims.len() {
            return Err(CebraError::InvalidConfig(format!(
                "session {session} out of range, solver has {} sessions",
                model.input_dims.len()
            )));
        }
        let dataset = data.session(session).ok_or_else(|| {
            CebraError::InvalidData(format!(
                "dataset has {} sessions, requested session {session}",
                data.num_sessions()
            ))
        })?;
        embed_signal(model.encoder(session), dataset.signal(), &self.core.device)
    }

    /// Offset shared by every session encoder, checked against the fitted model if there is one.
    fn planned_offset(&self, input_dims: &[usize]) -> Result<Offset> {
        let Some(model) = &self.model else {
            return Ok(self.core.config.architecture()?.offset());
        };
        if model.input_dims.len() != input_dims.len() {
            return Err(CebraError::InvalidData(format!(
                "solver was fitted on {} sessions, got {}",
                model.input_dims.len(),
                input_dims.len()
            )));
        }
        for (&expected, &actual) in model.input_dims.iter().zip(input_dims) {
            if expected != actual {
                return Err(CebraError::DimensionMismatch { expected, actual });
            }
        }
        Ok(model.encoders[0].offset())
    }

    fn prepare(&mut self, input_dims: &[usize]) -> Result<()> {
        if self.model.is_some() {
            self.planned_offset(input_dims)?;
            return Ok(());
        }
        let assembled = Self::assemble(&self.core.config, &self.core.device, input_dims, None)?;
        let device = self.core.device.clone();
        self.model = Some(self.core.install(assembled, device));
        Ok(())
    }

    fn assemble(
        config: &SolverConfig,
        device: &Device,
        input_dims: &[usize],
        restore: Option<Restore<'_>>,
    ) -> Result<Assembled<MultiSessionModel>> {
        if input_dims.is_empty() {
            return Err(CebraError::InvalidData(
                "multi-session training needs at least one session".to_string(),
            ));
        }
        if config.share_encoder && input_dims.iter().any(|&d| d != input_dims[0]) {
            return Err(CebraError::InvalidConfig(format!(
                "share_encoder needs equal input dimensions, got {input_dims:?}"
            )));
        }
        SolverCore::assemble(
            config,
            device,
            |params| {
                let encoders = if config.share_encoder {
                    vec![build_encoder(config, &mut params.pp(ENCODER_PREFIX), input_dims[0])?]
                } else {
                    input_dims
                        .iter()
                        .enumerate()
                        .map(|(i, &dim)| build_encoder(config, &mut params.pp(ENCODER_PREFIX).pp(i), dim))
                        .collect::<Result<Vec<_>>>()?
                };
                let criterion = build_criterion(config, params)?;
                Ok(MultiSessionModel {
                    encoders,
                    criterion,
                    input_dims: input_dims.to_vec(),
                })
            },
            restore,
        )
    }
}

impl Trainable for MultiSessionSolver {
    fn core(&self) -> &SolverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        Ok(Checkpoint {
            state: CheckpointState {
                solver: SolverKind::MultiSession,
                step: self.core.step,
                optimizer_steps: self.core.optimizer_steps(),
                input_dims: model.input_dims.clone(),
                num_targets: None,
                labels: self.core.labels,
            },
            config: self.core.config.clone(),
            tensors: self.core.checkpoint_tensors()?,
        })
    }

    fn temperature(&self) -> Result<Option<f32>> {
        match &self.model {
            Some(model) => model.criterion.temperature(),
            None => Ok(None),
        }
    }
}

impl Solver for MultiSessionSolver {
    type Input = MultiSessionDataset;
    type Output = Vec<Tensor>;

    fn fit(&mut self, data: &MultiSessionDataset, num_steps: usize) -> Result<FitOutcome> {
        let batch_size = self.core.config.batch_size;
        self.fit_with_batch_size(data, num_steps, batch_size)
    }

    fn transform(&self, data: &MultiSessionDataset) -> Result<Vec<Tensor>> {
        (0..data.num_sessions())
            .map(|i| self.transform_session(data, i))
            .collect()
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.checkpoint()?.save(path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let ckpt = Checkpoint::load(path, &self.core.device)?;
        if ckpt.state.solver != SolverKind::MultiSession {
            return Err(CebraError::Checkpoint(format!(
                "checkpoint was written by a {:?} solver",
                ckpt.state.solver
            )));
        }
        let config = self.core.merged_config(&ckpt.config);
        config.validate()?;
        let params = ckpt.component_without(OPTIMIZER_PREFIX);
        let optimizer = ckpt.component(OPTIMIZER_PREFIX);
        let assembled = Self::assemble(
            &config,
            &self.core.device,
            &ckpt.state.input_dims,
            Some(Restore {
                params: &params,
                optimizer: &optimizer,
                optimizer_steps: ckpt.state.optimizer_steps,
            }),
        )?;
        let device = self.core.device.clone();
        self.core.config = config;
        self.core.phase = Phase::Uninitialized;
        self.model = Some(self.core.install(assembled, device));
        self.core.step = ckpt.state.step;
        self.core.labels = ckpt.state.labels;
        self.core.history = History::new();
        Ok(())
    }

    fn history(&self) -> &History {
        &self.core.history
    }

    fn step(&self) -> usize {
        self.core.step
    }

    fn phase(&self) -> Phase {
        self.core.phase
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        let Some(model) = &self.model else {
            self.core.device = device.clone();
            return Ok(());
        };
        let input_dims = model.input_dims.clone();
        let (params, optimizer) = self.core.moved_state(device)?;
        let assembled = Self::assemble(
            &self.core.config,
            device,
            &input_dims,
            Some(Restore {
                params: &params,
                optimizer: &optimizer,
                optimizer_steps: self.core.optimizer_steps(),
            }),
        )?;
        self.model = Some(self.core.install(assembled, device.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDataset;
    use crate::distributions::Conditional;

    fn session(n: usize, c: usize, phase: f32) -> TensorDataset {
        let values = (0..n * c).map(|i| (i as f32 * 0.21 + phase).cos()).collect();
        let labels = (0..n).map(|i| i as f32 / n as f32).collect();
        TensorDataset::from_vec(values, n, c, &Device::Cpu)
            .unwrap()
            .with_continuous(labels, 1)
            .unwrap()
    }

    fn config() -> SolverConfig {
        SolverConfig {
            model: "offset1-model".to_string(),
            batch_size: 8,
            device: "cpu".to_string(),
            conditional: Conditional::Delta,
            log_interval: 0,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn test_shared_encoder_needs_equal_dims() {
        let data =
            MultiSessionDataset::new(vec![session(30, 4, 0.0), session(30, 5, 1.0)]).unwrap();
        let mut solver = MultiSessionSolver::new(SolverConfig {
            share_encoder: true,
            ..config()
        })
        .unwrap();
        assert!(matches!(
            solver.fit(&data, 1),
            Err(CebraError::InvalidConfig(_))
        ));
        assert_eq!(solver.phase(), Phase::Uninitialized);
    }

    #[test]
    fn test_shared_encoder_fit() {
        let data =
            MultiSessionDataset::new(vec![session(30, 4, 0.0), session(25, 4, 1.0)]).unwrap();
        let mut solver = MultiSessionSolver::new(SolverConfig {
            share_encoder: true,
            ..config()
        })
        .unwrap();
        solver.fit(&data, 2).unwrap();
        let out = solver.transform(&data).unwrap();
        assert_eq!(out[0].dims(), &[30, 8]);
        assert_eq!(out[1].dims(), &[25, 8]);
        assert!(solver.transform_session(&data, 2).is_err());
    }

    #[test]
    fn test_session_count_is_fixed_after_fit() {
        let two =
            MultiSessionDataset::new(vec![session(30, 4, 0.0), session(30, 6, 1.0)]).unwrap();
        let one = MultiSessionDataset::new(vec![session(30, 4, 0.0)]).unwrap();
        let mut solver = MultiSessionSolver::new(config()).unwrap();
        solver.fit(&two, 1).unwrap();
        assert_eq!(solver.num_sessions(), Some(2));
        assert!(solver.fit(&one, 1).is_err());
    }

    #[test]
    fn test_short_session_leaves_no_model() {
        let short =
            MultiSessionDataset::new(vec![session(30, 4, 0.0), session(6, 4, 1.0)]).unwrap();
        let mut solver = MultiSessionSolver::new(SolverConfig {
            model: "offset10-model".to_string(),
            ..config()
        })
        .unwrap();
        assert!(matches!(
            solver.fit(&short, 1),
            Err(CebraError::InsufficientSamples { .. })
        ));
        assert_eq!(solver.phase(), Phase::Uninitialized);
        assert_eq!(solver.num_sessions(), None);

        let data =
            MultiSessionDataset::new(vec![session(30, 3, 0.0), session(40, 5, 1.0)]).unwrap();
        solver.fit(&data, 1).unwrap();
        assert_eq!(solver.num_sessions(), Some(2));
        assert_eq!(solver.transform_session(&data, 1).unwrap().dims(), &[31, 8]);
    }
}
