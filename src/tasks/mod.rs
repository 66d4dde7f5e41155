pub mod train;
pub mod transform;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use cebra::data::load_dataset;
use cebra::{MultiSessionDataset, TensorDataset};

/// Datasets are read to the CPU; solvers move batches to their own device.
fn load_sessions(paths: &[PathBuf]) -> Result<Vec<TensorDataset>> {
    paths
        .iter()
        .map(|path| {
            load_dataset(path, &Device::Cpu).with_context(|| format!("loading dataset {path:?}"))
        })
        .collect()
}

fn load_single(paths: &[PathBuf]) -> Result<TensorDataset> {
    let mut sessions = load_sessions(paths)?;
    if sessions.len() != 1 {
        anyhow::bail!(
            "this solver takes exactly one dataset, got {} (use --solver multi for several)",
            sessions.len()
        );
    }
    Ok(sessions.remove(0))
}

fn load_multi(paths: &[PathBuf]) -> Result<MultiSessionDataset> {
    MultiSessionDataset::new(load_sessions(paths)?).context("building multi-session dataset")
}
