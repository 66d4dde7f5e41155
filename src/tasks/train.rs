use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use cebra::{
    Dataset, FitOutcome, MultiSessionSolver, SingleSessionSolver, Solver, SolverConfig, StopHandle,
    SupervisedSolver,
};
use tracing::{info, warn};

use super::{load_multi, load_single};
use crate::{SolverArg, TrainArgs};

const FINAL_CHECKPOINT: &str = "checkpoint.safetensors";
const HISTORY_FILE: &str = "history.json";

fn build_config(args: &TrainArgs) -> Result<SolverConfig> {
    let mut config = match &args.config {
        Some(path) => SolverConfig::from_json_file(path)
            .with_context(|| format!("reading config {path:?}"))?,
        None => SolverConfig::default(),
    };
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.lr {
        config.learning_rate = v;
    }
    if let Some(v) = args.output_dimension {
        config.output_dimension = v;
    }
    if let Some(v) = args.hidden_units {
        config.num_hidden_units = v;
    }
    if let Some(v) = &args.conditional {
        config.conditional = v.parse()?;
    }
    if let Some(v) = args.time_offset {
        config.time_offset = v;
    }
    if let Some(v) = args.delta {
        config.delta = v;
    }
    if let Some(v) = &args.criterion {
        config.criterion = v.parse()?;
    }
    if let Some(v) = &args.distance {
        config.distance = v.parse()?;
    }
    if let Some(v) = args.temperature {
        config.temperature = v;
    }
    if let Some(v) = &args.temperature_mode {
        config.temperature_mode = v.parse()?;
    }
    if let Some(v) = args.min_temperature {
        config.min_temperature = v;
    }
    if args.share_encoder {
        config.share_encoder = true;
    }
    if let Some(v) = &args.device {
        config.device = v.clone();
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    if let Some(v) = args.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = args.checkpoint_interval {
        config.checkpoint_interval = v;
    }
    config.output_dir = Some(args.output_dir.clone());
    config.validate().context("invalid solver configuration")?;
    Ok(config)
}

/// Ctrl-C asks the solver to stop at the next step boundary.
fn install_stop_handler(handle: StopHandle) -> Result<()> {
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current step");
        handle.stop();
    })
    .context("installing Ctrl-C handler")
}

fn fit_and_save<S: Solver>(
    solver: &mut S,
    data: &S::Input,
    args: &TrainArgs,
) -> Result<()> {
    if let Some(resume) = &args.resume {
        solver
            .load(resume)
            .with_context(|| format!("resuming from {resume:?}"))?;
        info!(step = solver.step(), "resumed from {resume:?}");
    }

    let start = Instant::now();
    let outcome = solver.fit(data, args.steps).context("training failed")?;
    let elapsed = start.elapsed().as_secs_f64();
    let checkpoint = args.output_dir.join(FINAL_CHECKPOINT);
    match outcome {
        FitOutcome::Completed { step } => {
            solver
                .save(&checkpoint)
                .with_context(|| format!("saving {checkpoint:?}"))?;
            info!("finished at step {step} in {elapsed:.1}s, checkpoint {checkpoint:?}");
        }
        FitOutcome::Interrupted { step } => {
            info!("interrupted at step {step} after {elapsed:.1}s, checkpoint {checkpoint:?}");
        }
    }
    write_history(solver.history(), &args.output_dir)
}

fn write_history(history: &cebra::History, dir: &Path) -> Result<()> {
    let path = dir.join(HISTORY_FILE);
    history
        .write_json(&path)
        .with_context(|| format!("writing {path:?}"))?;
    if let Some(last) = history.last() {
        info!(
            "last loss {:.4} (alignment {:.4}, uniformity {:.4})",
            last.loss, last.alignment, last.uniformity
        );
    }
    Ok(())
}

pub fn run(args: TrainArgs) -> Result<()> {
    let config = build_config(&args)?;
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {:?}", args.output_dir))?;

    match args.solver {
        SolverArg::Single => {
            let data = load_single(&args.data)?;
            let mut solver = SingleSessionSolver::new(config)?;
            install_stop_handler(solver.stop_handle())?;
            fit_and_save(&mut solver, &data as &dyn Dataset, &args)
        }
        SolverArg::Supervised => {
            let data = load_single(&args.data)?;
            let mut solver = SupervisedSolver::new(config)?;
            install_stop_handler(solver.stop_handle())?;
            fit_and_save(&mut solver, &data as &dyn Dataset, &args)
        }
        SolverArg::Multi => {
            let data = load_multi(&args.data)?;
            let mut solver = MultiSessionSolver::new(config)?;
            install_stop_handler(solver.stop_handle())?;
            fit_and_save(&mut solver, &data, &args)
        }
    }
}
