use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use tracing::{info, warn};

use super::checkpoint::{Checkpoint, CheckpointState, LabelSchema, SolverKind, OPTIMIZER_PREFIX};
use super::{
    format_params, train_loop, Assembled, FitOutcome, History, Phase, Restore, Solver, SolverCore,
    StopHandle, Trainable, CRITERION_PREFIX, ENCODER_PREFIX,
};
use crate::config::{CriterionKind, SolverConfig};
use crate::criterion::{Criterion, Distance, InfoNce, Mse};
use crate::data::{Dataset, Offset};
use crate::distributions::{
    BatchIndex, Conditional, ContinuousSampler, DiscreteSampler, Perturbation, Sampler,
    TimeContrastiveSampler,
};
use crate::error::{CebraError, Result};
use crate::model::{Encoder, ParamBuilder};

pub(crate) struct ContrastiveModel {
    pub(crate) encoder: Box<dyn Encoder>,
    pub(crate) criterion: Box<dyn Criterion>,
}

/// Criterion parameters live under `criterion.*`.
pub(crate) fn build_criterion(
    config: &SolverConfig,
    params: &mut ParamBuilder<'_>,
) -> Result<Box<dyn Criterion>> {
    let criterion: Box<dyn Criterion> = match config.criterion {
        CriterionKind::InfoNce => Box::new(InfoNce::new(
            &mut params.pp(CRITERION_PREFIX),
            config.distance,
            config.temperature(),
        )?),
        CriterionKind::Mse => Box::new(Mse::new(config.mse_margin)?),
    };
    Ok(criterion)
}

pub(crate) fn build_encoder(
    config: &SolverConfig,
    params: &mut ParamBuilder<'_>,
    num_input: usize,
) -> Result<Box<dyn Encoder>> {
    let arch = config.architecture()?;
    let encoder = arch.build(params, num_input, config.num_hidden_units, config.output_dimension)?;
    if !encoder.normalize()
        && config.criterion == CriterionKind::InfoNce
        && config.distance == Distance::Cosine
    {
        warn!(model = %arch, "cosine similarity on an unnormalized model, consider distance=euclidean");
    }
    Ok(Box::new(encoder))
}

/// Sampler for one dataset under the configured conditional.
pub(crate) fn build_sampler(
    config: &SolverConfig,
    data: &dyn Dataset,
    offset: Offset,
) -> Result<Box<dyn Sampler>> {
    let sampler: Box<dyn Sampler> = match config.conditional {
        Conditional::Time => Box::new(TimeContrastiveSampler::new(data, offset, config.time_offset)?),
        Conditional::Discrete => Box::new(DiscreteSampler::new(data, offset)?),
        Conditional::Delta => Box::new(ContinuousSampler::new(
            data,
            offset,
            Perturbation::Gaussian { std: config.delta },
            config.delta,
        )?),
        Conditional::TimeDelta => Box::new(ContinuousSampler::new(
            data,
            offset,
            Perturbation::Empirical {
                lag: config.time_offset,
            },
            config.delta,
        )?),
    };
    Ok(sampler)
}

/// Embeds every valid index of `signal` (`[samples, features]`) into `[samples - offset.len() + 1, dim]`.
pub(crate) fn embed_signal(encoder: &dyn Encoder, signal: &Tensor, device: &Device) -> Result<Tensor> {
    let (num_samples, num_features) = signal.dims2()?;
    if num_features != encoder.num_input() {
        return Err(CebraError::DimensionMismatch {
            expected: encoder.num_input(),
            actual: num_features,
        });
    }
    let offset = encoder.offset();
    offset.ensure_valid(num_samples, 1)?;
    let xs = signal.to_device(device)?.t()?.unsqueeze(0)?.contiguous()?;
    let out = encoder.forward(&xs)?.detach();
    Ok(out.squeeze(0)?.t()?.contiguous()?)
}

/// Windows for reference, positive and negative indices in a single encoder pass.
pub(crate) fn embed_batch(
    encoder: &dyn Encoder,
    data: &dyn Dataset,
    batch: &BatchIndex,
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    let b = batch.len();
    let indices: Vec<usize> = batch
        .reference
        .iter()
        .chain(&batch.positive)
        .chain(&batch.negative)
        .copied()
        .collect();
    let windows = data.get_input(&indices, encoder.offset())?.to_device(device)?;
    let emb = encoder.embed(&windows)?;
    Ok((emb.narrow(0, 0, b)?, emb.narrow(0, b, b)?, emb.narrow(0, 2 * b, b)?))
}

/// Contrastive solver for one recording.
///
/// Positives follow the configured conditional: `time` needs no labels,
/// `discrete`, `delta` and `time_delta` are conditioned on auxiliary variables.
pub struct SingleSessionSolver {
    core: SolverCore,
    model: Option<ContrastiveModel>,
}

impl SingleSessionSolver {
    pub fn new(config: SolverConfig) -> Result<Self> {
        Ok(Self {
            core: SolverCore::new(config)?,
            model: None,
        })
    }

    /// Solver conditioned on auxiliary variables through `conditional`.
    pub fn with_conditional(config: SolverConfig, conditional: Conditional) -> Result<Self> {
        Self::new(SolverConfig {
            conditional,
            ..config
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.core.config
    }

    pub fn device(&self) -> &Device {
        &self.core.device
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.core.stop.clone()
    }

    pub fn offset(&self) -> Option<Offset> {
        self.model.as_ref().map(|m| m.encoder.offset())
    }

    pub fn num_parameters(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.encoder.num_parameters())
    }

    pub fn fit_with_batch_size(
        &mut self,
        data: &dyn Dataset,
        num_steps: usize,
        batch_size: usize,
    ) -> Result<FitOutcome> {
        if batch_size == 0 {
            return Err(CebraError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        // Data checks run before the model exists, so a rejected fit leaves no model behind.
        let offset = self.planned_offset(data.input_dimension())?;
        let sampler = build_sampler(&self.core.config, data, offset)?;
        self.prepare(data.input_dimension())?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        self.core.labels = LabelSchema::of(data);
        if batch_size > offset.num_valid(data.len()) {
            warn!(
                batch_size,
                valid = offset.num_valid(data.len()),
                "batch size exceeds the number of valid indices, samples repeat within a batch"
            );
        }
        info!(
            "fit: {} steps from step {} | model {} ({} params) | {} samples x {} features | conditional {} | batch {}",
            num_steps,
            self.core.step,
            self.core.config.model,
            format_params(model.encoder.num_parameters()),
            data.len(),
            data.input_dimension(),
            self.core.config.conditional,
            batch_size
        );

        train_loop(self, num_steps, |solver: &Self, rng: &mut StdRng| {
            let model = solver.model.as_ref().ok_or(CebraError::NotFitted)?;
            let batch = sampler.sample(rng, batch_size)?;
            let (r, p, n) = embed_batch(model.encoder.as_ref(), data, &batch, &solver.core.device)?;
            model.criterion.compute(&r, &p, &n)
        })
    }

    /// Offset of the current model, or of the configured architecture before the first fit.
    fn planned_offset(&self, num_input: usize) -> Result<Offset> {
        match &self.model {
            Some(model) => {
                if model.encoder.num_input() != num_input {
                    return Err(CebraError::DimensionMismatch {
                        expected: model.encoder.num_input(),
                        actual: num_input,
                    });
                }
                Ok(model.encoder.offset())
            }
            None => Ok(self.core.config.architecture()?.offset()),
        }
    }

    /// Builds the model on first use, otherwise checks the input dimension.
    fn prepare(&mut self, num_input: usize) -> Result<()> {
        if self.model.is_some() {
            self.planned_offset(num_input)?;
            return Ok(());
        }
        let assembled = Self::assemble(&self.core.config, &self.core.device, num_input, None)?;
        let device = self.core.device.clone();
        self.model = Some(self.core.install(assembled, device));
        Ok(())
    }

    fn assemble(
        config: &SolverConfig,
        device: &Device,
        num_input: usize,
        restore: Option<Restore<'_>>,
    ) -> Result<Assembled<ContrastiveModel>> {
        SolverCore::assemble(
            config,
            device,
            |params| {
                let encoder = build_encoder(config, &mut params.pp(ENCODER_PREFIX), num_input)?;
                let criterion = build_criterion(config, params)?;
                Ok(ContrastiveModel { encoder, criterion })
            },
            restore,
        )
    }
}

impl Trainable for SingleSessionSolver {
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
                solver: SolverKind::SingleSession,
                step: self.core.step,
                optimizer_steps: self.core.optimizer_steps(),
                input_dims: vec![model.encoder.num_input()],
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

impl Solver for SingleSessionSolver {
    type Input = dyn Dataset;
    type Output = Tensor;

    fn fit(&mut self, data: &Self::Input, num_steps: usize) -> Result<FitOutcome> {
        let batch_size = self.core.config.batch_size;
        self.fit_with_batch_size(data, num_steps, batch_size)
    }

    fn transform(&self, data: &Self::Input) -> Result<Tensor> {
        self.core.ensure_fitted()?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        embed_signal(model.encoder.as_ref(), data.signal(), &self.core.device)
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.checkpoint()?.save(path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let ckpt = Checkpoint::load(path, &self.core.device)?;
        if ckpt.state.solver != SolverKind::SingleSession {
            return Err(CebraError::Checkpoint(format!(
                "checkpoint was written by a {:?} solver",
                ckpt.state.solver
            )));
        }
        let &[num_input] = ckpt.state.input_dims.as_slice() else {
            return Err(CebraError::Checkpoint(format!(
                "expected one input dimension, found {:?}",
                ckpt.state.input_dims
            )));
        };
        let config = self.core.merged_config(&ckpt.config);
        config.validate()?;
        let params = ckpt.component_without(OPTIMIZER_PREFIX);
        let optimizer = ckpt.component(OPTIMIZER_PREFIX);
        let assembled = Self::assemble(
            &config,
            &self.core.device,
            num_input,
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
        let num_input = model.encoder.num_input();
        let (params, optimizer) = self.core.moved_state(device)?;
        let assembled = Self::assemble(
            &self.core.config,
            device,
            num_input,
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
