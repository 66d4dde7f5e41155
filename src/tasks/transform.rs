use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::Tensor;
use cebra::data::save_tensors;
use cebra::{
    Dataset, MultiSessionSolver, SingleSessionSolver, Solver, SolverConfig, SupervisedSolver,
};
use tracing::info;

use super::{load_multi, load_single};
use crate::{SolverArg, TransformArgs};

const EMBEDDING_KEY: &str = "embedding";
const PREDICTION_KEY: &str = "prediction";

fn runtime_config(args: &TransformArgs) -> SolverConfig {
    SolverConfig {
        device: args.device.clone(),
        log_interval: 0,
        ..SolverConfig::default()
    }
}

/// Single-session output under `embedding`; multi-session under `embedding.<session>`.
pub fn run(args: TransformArgs) -> Result<()> {
    let config = runtime_config(&args);
    let load_err = || format!("loading checkpoint {:?}", args.checkpoint);
    let mut tensors: HashMap<String, Tensor> = HashMap::new();

    match args.solver {
        SolverArg::Single => {
            let data = load_single(&args.data)?;
            let mut solver = SingleSessionSolver::new(config)?;
            solver.load(&args.checkpoint).with_context(load_err)?;
            let embedding = solver.transform(&data as &dyn Dataset)?;
            tensors.insert(EMBEDDING_KEY.to_string(), embedding);
        }
        SolverArg::Supervised => {
            let data = load_single(&args.data)?;
            let mut solver = SupervisedSolver::new(config)?;
            solver.load(&args.checkpoint).with_context(load_err)?;
            tensors.insert(EMBEDDING_KEY.to_string(), solver.transform(&data as &dyn Dataset)?);
            tensors.insert(PREDICTION_KEY.to_string(), solver.predict(&data)?);
        }
        SolverArg::Multi => {
            let data = load_multi(&args.data)?;
            let mut solver = MultiSessionSolver::new(config)?;
            solver.load(&args.checkpoint).with_context(load_err)?;
            for (i, embedding) in solver.transform(&data)?.into_iter().enumerate() {
                tensors.insert(format!("{EMBEDDING_KEY}.{i}"), embedding);
            }
        }
    }

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
    }
    save_tensors(&tensors, &args.output).with_context(|| format!("writing {:?}", args.output))?;
    for (name, tensor) in &tensors {
        info!("{name}: {:?}", tensor.dims());
    }
    info!("wrote {:?}", args.output);
    Ok(())
}
