//! Contrastive embeddings of time-series recordings on candle.
//!
//! A solver owns encoder(s), a criterion and an optimizer and trains them on
//! index triples drawn by a sampler:
//!
//! ```no_run
//! use cebra::{Conditional, SingleSessionSolver, Solver, SolverConfig, TensorDataset};
//! use candle_core::Device;
//!
//! # fn main() -> cebra::Result<()> {
//! let values: Vec<f32> = (0..1000 * 4).map(|i| (i as f32 * 0.01).sin()).collect();
//! let data = TensorDataset::from_vec(values, 1000, 4, &Device::Cpu)?;
//! let config = SolverConfig {
//!     conditional: Conditional::Time,
//!     device: "cpu".to_string(),
//!     ..SolverConfig::default()
//! };
//! let mut solver = SingleSessionSolver::new(config)?;
//! solver.fit(&data, 100)?;
//! let embedding = solver.transform(&data)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod criterion;
pub mod data;
pub mod device;
pub mod distributions;
pub mod error;
pub mod model;
pub mod optim;
pub mod solver;

pub use config::{CriterionKind, SolverConfig, TemperatureMode};
pub use criterion::{Criterion, Distance, InfoNce, LossOutput, Mse, Temperature};
pub use data::{ContinuousLabels, Dataset, MultiSessionDataset, Offset, TensorDataset};
pub use distributions::{BatchIndex, Conditional, Sampler};
pub use error::{CebraError, ErrorKind, Result};
pub use model::{Architecture, Encoder};
pub use solver::{
    Checkpoint, FitOutcome, History, HistoryRecord, MultiSessionSolver, Phase, SingleSessionSolver,
    Solver, StopHandle, SupervisedSolver,
};
