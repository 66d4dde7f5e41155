use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use tracing::info;

use super::checkpoint::{Checkpoint, CheckpointState, LabelSchema, SolverKind, OPTIMIZER_PREFIX};
use super::single_session::{build_encoder, embed_signal};
use super::{
    format_params, train_loop, Assembled, FitOutcome, History, Phase, Restore, Solver, SolverCore,
    StopHandle, Trainable, ENCODER_PREFIX, HEAD_PREFIX,
};
use crate::config::SolverConfig;
use crate::criterion::LossOutput;
use crate::data::{Dataset, Offset};
use crate::distributions::uniform_indices;
use crate::error::{CebraError, Result};
use crate::model::{Encoder, Predictor};

/// What the head predicts. Discrete labels win when a dataset carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Classes(usize),
    Regression(usize),
}

impl Target {
    fn of(data: &dyn Dataset) -> Result<Self> {
        if let Some(labels) = data.discrete() {
            let max = labels.iter().copied().max().unwrap_or(0);
            return Ok(Self::Classes(max as usize + 1));
        }
        if let Some(labels) = data.continuous() {
            return Ok(Self::Regression(labels.dim()));
        }
        Err(CebraError::InvalidConfig(
            "supervised training needs discrete or continuous labels".to_string(),
        ))
    }

    fn from_state(labels: LabelSchema, num_targets: usize) -> Self {
        if labels.has_discrete {
            Self::Classes(num_targets)
        } else {
            Self::Regression(num_targets)
        }
    }

    fn num_targets(self) -> usize {
        match self {
            Self::Classes(n) | Self::Regression(n) => n,
        }
    }

    /// Checks that `data` can be scored against a head built for `self`.
    fn check(self, data: &dyn Dataset) -> Result<()> {
        match (self, Self::of(data)?) {
            (Self::Classes(n), Self::Classes(m)) if m <= n => Ok(()),
            (Self::Regression(n), Self::Regression(m)) if m == n => Ok(()),
            (expected, found) => Err(CebraError::InvalidData(format!(
                "labels describe {found:?}, the head was built for {expected:?}"
            ))),
        }
    }
}

struct SupervisedModel {
    encoder: Box<dyn Encoder>,
    head: Predictor,
    target: Target,
}

/// Encoder plus a ReLU/linear readout trained directly on the labels.
///
/// Cross-entropy for discrete labels, mean squared error for continuous ones.
/// Batches are drawn uniformly from the valid indices.
pub struct SupervisedSolver {
    core: SolverCore,
    model: Option<SupervisedModel>,
}

impl SupervisedSolver {
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

    pub fn offset(&self) -> Option<Offset> {
        self.model.as_ref().map(|m| m.encoder.offset())
    }

    pub fn num_targets(&self) -> Option<usize> {
        self.model.as_ref().map(|m| m.target.num_targets())
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
        let offset = self.planned_offset(data)?;
        offset.ensure_valid(data.len(), 1)?;
        self.prepare(data)?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        let valid = offset.valid_range(data.len());
        info!(
            "fit: {} steps from step {} | model {} ({} params) | {:?} | batch {}",
            num_steps,
            self.core.step,
            self.core.config.model,
            format_params(model.encoder.num_parameters()),
            model.target,
            batch_size
        );
        self.core.labels = LabelSchema::of(data);

        train_loop(self, num_steps, |solver: &Self, rng: &mut StdRng| {
            let model = solver.model.as_ref().ok_or(CebraError::NotFitted)?;
            let device = &solver.core.device;
            let indices = uniform_indices(rng, valid.clone(), batch_size);
            let windows = data.get_input(&indices, offset)?.to_device(device)?;
            let outputs = model.head.forward(&model.encoder.embed(&windows)?)?;
            let loss = match model.target {
                Target::Classes(_) => {
                    let labels = data.discrete().ok_or_else(|| {
                        CebraError::InvalidData("dataset lost its discrete labels".to_string())
                    })?;
                    let targets: Vec<u32> = indices.iter().map(|&i| labels[i]).collect();
                    let targets = Tensor::from_vec(targets, batch_size, device)?;
                    candle_nn::loss::cross_entropy(&outputs, &targets)?
                }
                Target::Regression(dim) => {
                    let labels = data.continuous().ok_or_else(|| {
                        CebraError::InvalidData("dataset lost its continuous labels".to_string())
                    })?;
                    let targets: Vec<f32> = indices
                        .iter()
                        .flat_map(|&i| labels.row(i).iter().copied())
                        .collect();
                    let targets = Tensor::from_vec(targets, (batch_size, dim), device)?;
                    candle_nn::loss::mse(&outputs, &targets)?
                }
            };
            Ok(LossOutput {
                alignment: loss.detach(),
                uniformity: Tensor::zeros((), DType::F32, device)?,
                loss,
            })
        })
    }

    /// Head outputs for every valid index: class logits or regressed labels.
    pub fn predict(&self, data: &(dyn Dataset + 'static)) -> Result<Tensor> {
        let features = self.transform(data)?;
        let model = self.model.as_ref().ok_or(CebraError::NotFitted)?;
        model.head.forward(&features)
    }

    /// Checks the data against the current model, or against the configuration before the
    /// first fit, and returns the offset training will use.
    fn planned_offset(&self, data: &dyn Dataset) -> Result<Offset> {
        match &self.model {
            Some(model) => {
                if model.encoder.num_input() != data.input_dimension() {
                    return Err(CebraError::DimensionMismatch {
                        expected: model.encoder.num_input(),
                        actual: data.input_dimension(),
                    });
                }
                model.target.check(data)?;
                Ok(model.encoder.offset())
            }
            None => {
                Target::of(data)?;
                Ok(self.core.config.architecture()?.offset())
            }
        }
    }

    fn prepare(&mut self, data: &dyn Dataset) -> Result<()> {
        if self.model.is_some() {
            self.planned_offset(data)?;
            return Ok(());
        }
        let target = Target::of(data)?;
        let assembled = Self::assemble(
            &self.core.config,
            &self.core.device,
            data.input_dimension(),
            target,
            None,
        )?;
        let device = self.core.device.clone();
        self.model = Some(self.core.install(assembled, device));
        Ok(())
    }

    fn assemble(
        config: &SolverConfig,
        device: &Device,
        num_input: usize,
        target: Target,
        restore: Option<Restore<'_>>,
    ) -> Result<Assembled<SupervisedModel>> {
        SolverCore::assemble(
            config,
            device,
            |params| {
                let encoder = build_encoder(config, &mut params.pp(ENCODER_PREFIX), num_input)?;
                let head = Predictor::new(
                    &mut params.pp(HEAD_PREFIX),
                    encoder.num_output(),
                    target.num_targets(),
                )?;
                Ok(SupervisedModel {
                    encoder,
                    head,
                    target,
                })
            },
            restore,
        )
    }
}

impl Trainable for SupervisedSolver {
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
                solver: SolverKind::Supervised,
                step: self.core.step,
                optimizer_steps: self.core.optimizer_steps(),
                input_dims: vec![model.encoder.num_input()],
                num_targets: Some(model.target.num_targets()),
                labels: self.core.labels,
            },
            config: self.core.config.clone(),
            tensors: self.core.checkpoint_tensors()?,
        })
    }

    fn temperature(&self) -> Result<Option<f32>> {
        Ok(None)
    }
}

impl Solver for SupervisedSolver {
    type Input = dyn Dataset;
    type Output = Tensor;

    fn fit(&mut self, data: &Self::Input, num_steps: usize) -> Result<FitOutcome> {
        let batch_size = self.core.config.batch_size;
        self.fit_with_batch_size(data, num_steps, batch_size)
    }

    /// Encoder features, before the head.
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
        if ckpt.state.solver != SolverKind::Supervised {
            return Err(CebraError::Checkpoint(format!(
                "checkpoint was written by a {:?} solver",
                ckpt.state.solver
            )));
        }
        let (&[num_input], Some(num_targets)) =
            (ckpt.state.input_dims.as_slice(), ckpt.state.num_targets)
        else {
            return Err(CebraError::Checkpoint(
                "supervised checkpoint needs one input dimension and a target count".to_string(),
            ));
        };
        let target = Target::from_state(ckpt.state.labels, num_targets);
        let config = self.core.merged_config(&ckpt.config);
        config.validate()?;
        let params = ckpt.component_without(OPTIMIZER_PREFIX);
        let optimizer = ckpt.component(OPTIMIZER_PREFIX);
        let assembled = Self::assemble(
            &config,
            &self.core.device,
            num_input,
            target,
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
        let (num_input, target) = (model.encoder.num_input(), model.target);
        let (params, optimizer) = self.core.moved_state(device)?;
        let assembled = Self::assemble(
            &self.core.config,
            device,
            num_input,
            target,
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

    fn config() -> SolverConfig {
        SolverConfig {
            model: "offset1-model".to_string(),
            batch_size: 16,
            learning_rate: 1e-2,
            device: "cpu".to_string(),
            log_interval: 0,
            ..SolverConfig::default()
        }
    }

    fn signal(n: usize) -> TensorDataset {
        let values = (0..n * 2)
            .map(|i| if (i / 2) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        TensorDataset::from_vec(values, n, 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_needs_labels() {
        let mut solver = SupervisedSolver::new(config()).unwrap();
        assert!(matches!(
            solver.fit(&signal(20), 1),
            Err(CebraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_classification_shapes_and_progress() {
        let labels = (0..40).map(|i| (i % 2) as u32).collect();
        let data = signal(40).with_discrete(labels).unwrap();
        let mut solver = SupervisedSolver::new(config()).unwrap();
        solver.fit(&data, 30).unwrap();
        assert_eq!(solver.num_targets(), Some(2));
        assert_eq!(solver.transform(&data).unwrap().dims(), &[40, 8]);
        assert_eq!(solver.predict(&data).unwrap().dims(), &[40, 2]);
        assert_eq!(solver.history().len(), 30);
        assert!(solver
            .history()
            .records()
            .iter()
            .all(|r| r.temperature.is_none() && r.uniformity == 0.0));
    }

    #[test]
    fn test_regression_checkpoint_round_trip() {
        let labels = (0..20).flat_map(|i| [i as f32 / 20.0, 1.0]).collect();
        let data = signal(20).with_continuous(labels, 2).unwrap();
        let mut solver = SupervisedSolver::new(config()).unwrap();
        solver.fit(&data, 3).unwrap();
        assert_eq!(solver.num_targets(), Some(2));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervised.safetensors");
        solver.save(&path).unwrap();
        let mut restored = SupervisedSolver::new(config()).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.step(), 3);
        assert_eq!(
            restored.predict(&data).unwrap().to_vec2::<f32>().unwrap(),
            solver.predict(&data).unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_label_kind_is_fixed_after_fit() {
        let discrete = signal(20).with_discrete((0..20).map(|i| i % 3).collect()).unwrap();
        let continuous = signal(20).with_continuous(vec![0.5; 20], 1).unwrap();
        let mut solver = SupervisedSolver::new(config()).unwrap();
        solver.fit(&discrete, 1).unwrap();
        assert!(matches!(
            solver.fit(&continuous, 1),
            Err(CebraError::InvalidData(_))
        ));
    }

    #[test]
    fn test_short_recording_leaves_no_model() {
        let mut solver = SupervisedSolver::new(SolverConfig {
            model: "offset10-model".to_string(),
            ..config()
        })
        .unwrap();
        let short = signal(5).with_discrete(vec![0, 1, 0, 1, 0]).unwrap();
        assert!(matches!(
            solver.fit(&short, 1),
            Err(CebraError::InsufficientSamples { .. })
        ));
        assert_eq!(solver.phase(), Phase::Uninitialized);
        assert_eq!(solver.num_targets(), None);

        let data = signal(30).with_discrete((0..30).map(|i| i % 3).collect()).unwrap();
        solver.fit(&data, 1).unwrap();
        assert_eq!(solver.num_targets(), Some(3));
        assert_eq!(solver.predict(&data).unwrap().dims(), &[21, 3]);
    }
}
