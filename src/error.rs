//! Error types for solver, sampling and checkpoint operations.

use thiserror::Error;

/// Coarse classification of [`CebraError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or incompatible dataset/model pairing. Raised before training.
    Configuration,
    /// Dataset cannot satisfy a sampling request.
    Data,
    /// Non-finite loss or gradient.
    Numeric,
    /// File system, checkpoint or serialization failure.
    Io,
}

#[derive(Debug, Error)]
pub enum CebraError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Offset with a negative side.
    #[error("invalid offset ({left}, {right}): both sides must be non-negative")]
    InvalidOffset { left: i64, right: i64 },

    /// Feature dimension of the data does not match the encoder.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A panic while the parameter store was locked left it unusable.
    #[error("parameter store lock poisoned")]
    LockPoisoned,

    /// Operation needs a fitted (or loaded) model.
    #[error("solver is not fitted: call fit() or load() first")]
    NotFitted,

    /// Malformed dataset content.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Too few valid indices for the requested offset or batch.
    #[error("insufficient samples: need at least {required} valid indices, have {available}")]
    InsufficientSamples { required: usize, available: usize },

    /// Auxiliary-variable matching could not produce a candidate.
    #[error("sampling failed: {0}")]
    Sampling(String),

    /// Loss or gradient became NaN/Inf.
    #[error("non-finite {quantity} at step {step} (last valid step {last_valid_step})")]
    NonFinite {
        quantity: &'static str,
        step: usize,
        last_valid_step: usize,
    },

    /// Checkpoint content is unreadable or does not fit this solver.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint written by an incompatible format version.
    #[error("incompatible checkpoint version {found:?} (expected {expected})")]
    IncompatibleCheckpoint { found: String, expected: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl CebraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidOffset { .. }
            | Self::DimensionMismatch { .. }
            | Self::NotFitted
            | Self::LockPoisoned => ErrorKind::Configuration,
            Self::InvalidData(_) | Self::InsufficientSamples { .. } | Self::Sampling(_) => {
                ErrorKind::Data
            }
            Self::NonFinite { .. } => ErrorKind::Numeric,
            // Backend errors surface from shape or device problems inside the step.
            Self::Tensor(_) => ErrorKind::Numeric,
            Self::Checkpoint(_)
            | Self::IncompatibleCheckpoint { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::SafeTensors(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, CebraError>;
