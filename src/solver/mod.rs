//! Training loop shared by every solver variant.
//!
//! A solver owns its parameters (one [`VarMap`]), one optimizer, the step
//! counter and the [`History`]. Models are built lazily at the first `fit`
//! (or `load`) once the input dimension is known.

pub mod checkpoint;
pub mod history;
mod multi_session;
mod single_session;
mod supervised;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};

use crate::config::SolverConfig;
use crate::criterion::LossOutput;
use crate::device::resolve_device;
use crate::distributions::step_rng;
use crate::error::{CebraError, Result};
use crate::model::params::{assign_vars, snapshot_vars, sorted_vars};
use crate::model::ParamBuilder;
use crate::optim::{Adam, ParamGroup, ParamsAdam};

pub use checkpoint::{Checkpoint, CheckpointState, LabelSchema, SolverKind};
pub use history::{History, HistoryRecord};
pub use multi_session::MultiSessionSolver;
pub use single_session::SingleSessionSolver;
pub use supervised::SupervisedSolver;

/// Name prefix of encoder parameters.
pub const ENCODER_PREFIX: &str = "encoder";
/// Name prefix of criterion parameters (the learnable temperature).
pub const CRITERION_PREFIX: &str = "criterion";
/// Name prefix of supervised readout parameters.
pub const HEAD_PREFIX: &str = "head";

const MODEL_GROUP: &str = "model";
const TEMPERATURE_GROUP: &str = "temperature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No model yet: call `fit` or `load`.
    Uninitialized,
    Ready,
    Stepping,
    /// Training ended, by budget or by a stop request. `fit` may continue from here.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitOutcome {
    /// Every requested step ran; `step` is the solver's step counter afterwards.
    Completed { step: usize },
    /// A stop request was seen before `step + 1` started.
    Interrupted { step: usize },
}

/// Cooperative stop request, checked at every step boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub trait Solver {
    type Input: ?Sized;
    type Output;

    /// Runs `num_steps` more optimizer steps with the configured batch size.
    fn fit(&mut self, data: &Self::Input, num_steps: usize) -> Result<FitOutcome>;

    /// Embeds every valid index of `data` without tracking gradients.
    fn transform(&self, data: &Self::Input) -> Result<Self::Output>;

    fn save(&self, path: &Path) -> Result<()>;

    /// Replaces model, optimizer state and step counter with the checkpoint's.
    /// History restarts empty. On error the solver is unchanged.
    fn load(&mut self, path: &Path) -> Result<()>;

    fn history(&self) -> &History;

    fn step(&self) -> usize;

    fn phase(&self) -> Phase;

    /// Moves parameters and optimizer state. On error nothing moves.
    fn to_device(&mut self, device: &Device) -> Result<()>;
}

/// State every solver variant carries.
pub(crate) struct SolverCore {
    pub(crate) config: SolverConfig,
    pub(crate) device: Device,
    pub(crate) varmap: VarMap,
    pub(crate) optimizer: Option<Adam>,
    pub(crate) history: History,
    pub(crate) step: usize,
    pub(crate) phase: Phase,
    pub(crate) stop: StopHandle,
    pub(crate) labels: LabelSchema,
}

/// Parameters and optimizer state to restore into a freshly built model.
pub(crate) struct Restore<'a> {
    pub(crate) params: &'a HashMap<String, Tensor>,
    pub(crate) optimizer: &'a HashMap<String, Tensor>,
    pub(crate) optimizer_steps: usize,
}

pub(crate) struct Assembled<M> {
    pub(crate) varmap: VarMap,
    pub(crate) model: M,
    pub(crate) optimizer: Adam,
}

impl SolverCore {
    pub(crate) fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let device = resolve_device(&config.device)?;
        Ok(Self {
            config,
            device,
            varmap: VarMap::new(),
            optimizer: None,
            history: History::new(),
            step: 0,
            phase: Phase::Uninitialized,
            stop: StopHandle::new(),
            labels: LabelSchema::default(),
        })
    }

    /// Builds a model with seeded initialization on `device`, its optimizer, and
    /// optionally restores saved state into both. Nothing is shared with the
    /// current model, so a failure leaves the solver untouched.
    pub(crate) fn assemble<M>(
        config: &SolverConfig,
        device: &Device,
        build: impl FnOnce(&mut ParamBuilder<'_>) -> Result<M>,
        restore: Option<Restore<'_>>,
    ) -> Result<Assembled<M>> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = {
            let mut params = ParamBuilder::new(&varmap, &mut rng, device);
            build(&mut params)?
        };
        let mut model_vars = Vec::new();
        let mut temperature_vars = Vec::new();
        for (name, var) in sorted_vars(&varmap)? {
            if name.starts_with(&format!("{CRITERION_PREFIX}.")) {
                temperature_vars.push((name, var));
            } else {
                model_vars.push((name, var));
            }
        }
        let groups = vec![
            ParamGroup {
                name: MODEL_GROUP.to_string(),
                lr: config.learning_rate,
                vars: model_vars,
            },
            ParamGroup {
                name: TEMPERATURE_GROUP.to_string(),
                lr: config.temperature_learning_rate(),
                vars: temperature_vars,
            },
        ];
        let params = ParamsAdam {
            weight_decay: config.weight_decay,
            ..ParamsAdam::default()
        };
        let mut optimizer = Adam::new(groups, params)?;
        if let Some(restore) = restore {
            assign_vars(&varmap, restore.params)?;
            optimizer.load_state(restore.optimizer, restore.optimizer_steps)?;
        }
        Ok(Assembled {
            varmap,
            model,
            optimizer,
        })
    }

    /// Swaps in a built model's parameters and optimizer; returns the model.
    pub(crate) fn install<M>(&mut self, assembled: Assembled<M>, device: Device) -> M {
        self.varmap = assembled.varmap;
        self.optimizer = Some(assembled.optimizer);
        self.device = device;
        if self.phase == Phase::Uninitialized {
            self.phase = Phase::Ready;
        }
        assembled.model
    }

    /// Parameters plus `optimizer.*` moments, as stored in checkpoints.
    pub(crate) fn checkpoint_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors: HashMap<String, Tensor> = snapshot_vars(&self.varmap)?.into_iter().collect();
        if let Some(opt) = &self.optimizer {
            tensors.extend(checkpoint::prefixed(
                checkpoint::OPTIMIZER_PREFIX,
                opt.state_tensors()?,
            ));
        }
        Ok(tensors)
    }

    pub(crate) fn optimizer_steps(&self) -> usize {
        self.optimizer.as_ref().map_or(0, Adam::step_count)
    }

    /// Parameters and optimizer moments moved to `device`, ready for [`SolverCore::assemble`].
    pub(crate) fn moved_state(
        &self,
        device: &Device,
    ) -> Result<(HashMap<String, Tensor>, HashMap<String, Tensor>)> {
        let params = snapshot_vars(&self.varmap)?
            .into_iter()
            .map(|(k, v)| Ok((k, v.to_device(device)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let optimizer = match &self.optimizer {
            Some(opt) => opt.moved_state(device)?,
            None => HashMap::new(),
        };
        Ok((params, optimizer))
    }

    /// Keeps runtime settings of the current config and takes the model
    /// definition from a loaded one.
    pub(crate) fn merged_config(&self, loaded: &SolverConfig) -> SolverConfig {
        SolverConfig {
            device: self.config.device.clone(),
            output_dir: self.config.output_dir.clone(),
            log_interval: self.config.log_interval,
            checkpoint_interval: self.config.checkpoint_interval,
            batch_size: self.config.batch_size,
            ..loaded.clone()
        }
    }

    pub(crate) fn ensure_fitted(&self) -> Result<()> {
        if self.phase == Phase::Uninitialized {
            return Err(CebraError::NotFitted);
        }
        Ok(())
    }

    fn checkpoint_path(&self, name: &str) -> Option<PathBuf> {
        self.config.output_dir.as_ref().map(|dir| dir.join(name))
    }
}

/// Hooks a solver variant provides to [`train_loop`].
pub(crate) trait Trainable {
    fn core(&self) -> &SolverCore;

    fn core_mut(&mut self) -> &mut SolverCore;

    fn checkpoint(&self) -> Result<Checkpoint>;

    fn temperature(&self) -> Result<Option<f32>>;
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Runs up to `num_steps` optimizer steps. `batch_loss` draws one batch with
/// the given RNG and returns its loss.
///
/// The solver ends in [`Phase::Stopped`] whether the run completes, is
/// interrupted, or fails partway through a step.
pub(crate) fn train_loop<T: Trainable>(
    solver: &mut T,
    num_steps: usize,
    batch_loss: impl Fn(&T, &mut StdRng) -> Result<LossOutput>,
) -> Result<FitOutcome> {
    let target = solver.core().step + num_steps;
    solver.core_mut().phase = Phase::Stepping;
    let outcome = run_steps(solver, target, batch_loss);
    solver.core_mut().phase = Phase::Stopped;
    outcome
}

fn run_steps<T: Trainable>(
    solver: &mut T,
    target: usize,
    batch_loss: impl Fn(&T, &mut StdRng) -> Result<LossOutput>,
) -> Result<FitOutcome> {
    while solver.core().step < target {
        let core = solver.core();
        let step = core.step + 1;
        if core.stop.is_stopped() {
            let last = core.step;
            info!(step = last, "stop requested");
            if let Some(path) = core.checkpoint_path("checkpoint.safetensors") {
                solver.checkpoint()?.save(&path)?;
                info!(?path, "saved checkpoint");
            }
            return Ok(FitOutcome::Interrupted { step: last });
        }

        let mut rng = step_rng(core.config.seed, step);
        let out = batch_loss(solver, &mut rng)?;
        let loss = scalar(&out.loss)?;
        if !loss.is_finite() {
            error!(step, last_valid_step = step - 1, loss, "non-finite loss, training halted");
            return Err(CebraError::NonFinite {
                quantity: "loss",
                step,
                last_valid_step: step - 1,
            });
        }
        let grads = out.loss.backward()?;
        let temperature = solver.temperature()?;

        let core = solver.core_mut();
        let schedule = core.config.lr_schedule;
        let optimizer = core.optimizer.as_mut().ok_or(CebraError::NotFitted)?;
        if !optimizer.grads_finite(&grads)? {
            error!(step, last_valid_step = step - 1, "non-finite gradient, training halted");
            return Err(CebraError::NonFinite {
                quantity: "gradient",
                step,
                last_valid_step: step - 1,
            });
        }
        optimizer.set_lr_factor(schedule.factor(step));
        optimizer.step(&grads)?;
        core.step = step;

        let record = HistoryRecord {
            step,
            loss,
            temperature,
            alignment: scalar(&out.alignment)?,
            uniformity: scalar(&out.uniformity)?,
        };
        core.history.push(record);

        let log_interval = core.config.log_interval;
        if log_interval > 0 && (step % log_interval == 0 || step == target) {
            let lr = optimizer.learning_rate(MODEL_GROUP).unwrap_or_default();
            info!(
                "step {step}/{target} loss {loss:.4} align {:.4} unif {:.4} temp {} lr {lr:.2e}",
                record.alignment,
                record.uniformity,
                temperature.map_or("-".to_string(), |t| format!("{t:.4}")),
            );
        }

        let interval = core.config.checkpoint_interval;
        if interval > 0 && step % interval == 0 {
            if let Some(path) = core.checkpoint_path(&format!("checkpoint_{step}.safetensors")) {
                solver.checkpoint()?.save(&path)?;
                info!(?path, "saved checkpoint");
            }
        }
    }

    Ok(FitOutcome::Completed {
        step: solver.core().step,
    })
}

/// Human-readable parameter count, e.g. `12.3k` or `1.20M`.
pub fn format_params(n: usize) -> String {
    const K: usize = 1_000;
    const M: usize = 1_000_000;
    const B: usize = 1_000_000_000;
    if n < M {
        format!("{:.1}k", n as f64 / K as f64)
    } else if n < B {
        format!("{:.2}M", n as f64 / M as f64)
    } else {
        format!("{:.2}B", n as f64 / B as f64)
    }
}
