mod config;

pub use config::{CriterionKind, SolverConfig, TemperatureMode};
