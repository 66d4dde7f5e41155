//! Versioned solver checkpoints stored as a single safetensors archive.
//!
//! Tensors are keyed by component (`encoder.*`, `criterion.*`, `optimizer.*`);
//! everything else lives in the archive's string metadata.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::config::SolverConfig;
use crate::error::{CebraError, Result};

pub const FORMAT: &str = "cebra-checkpoint";
pub const VERSION: &str = "1";

const KEY_FORMAT: &str = "format";
const KEY_VERSION: &str = "version";
const KEY_STATE: &str = "state";
const KEY_CONFIG: &str = "config";

pub const OPTIMIZER_PREFIX: &str = "optimizer";

/// Which solver wrote the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    SingleSession,
    MultiSession,
    Supervised,
}

/// Everything besides tensors needed to rebuild a solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub solver: SolverKind,
    pub step: usize,
    pub optimizer_steps: usize,
    pub input_dims: Vec<usize>,
    pub num_targets: Option<usize>,
    pub labels: LabelSchema,
}

/// Auxiliary variables the training data carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSchema {
    pub continuous_dim: Option<usize>,
    pub has_discrete: bool,
}

impl LabelSchema {
    pub fn of(data: &dyn crate::data::Dataset) -> Self {
        Self {
            continuous_dim: data.continuous().map(|c| c.dim()),
            has_discrete: data.discrete().is_some(),
        }
    }
}

pub struct Checkpoint {
    pub state: CheckpointState,
    pub config: SolverConfig,
    pub tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Writes to a sibling temporary file first, then renames over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert(KEY_FORMAT.to_string(), FORMAT.to_string());
        metadata.insert(KEY_VERSION.to_string(), VERSION.to_string());
        metadata.insert(KEY_STATE.to_string(), serde_json::to_string(&self.state)?);
        metadata.insert(KEY_CONFIG.to_string(), serde_json::to_string(&self.config)?);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("safetensors.tmp");
        let mut entries: Vec<(&String, &Tensor)> = self.tensors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        safetensors::serialize_to_file(entries, &Some(metadata), &tmp)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let metadata = header.metadata().as_ref().ok_or_else(|| {
            CebraError::Checkpoint(format!("{path:?} carries no checkpoint metadata"))
        })?;
        let get = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                CebraError::Checkpoint(format!("{path:?} is missing metadata '{key}'"))
            })
        };
        if get(KEY_FORMAT)? != FORMAT {
            return Err(CebraError::Checkpoint(format!(
                "{path:?} is not a {FORMAT} archive"
            )));
        }
        let version = get(KEY_VERSION)?;
        if version != VERSION {
            return Err(CebraError::IncompatibleCheckpoint {
                found: version.clone(),
                expected: VERSION.to_string(),
            });
        }
        let state: CheckpointState = serde_json::from_str(get(KEY_STATE)?)?;
        let config: SolverConfig = serde_json::from_str(get(KEY_CONFIG)?)?;
        let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
        Ok(Self {
            state,
            config,
            tensors,
        })
    }

    /// Tensors under `prefix.`, with the prefix stripped.
    pub fn component(&self, prefix: &str) -> HashMap<String, Tensor> {
        let head = format!("{prefix}.");
        self.tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&head).map(|rest| (rest.to_string(), v.clone())))
            .collect()
    }

    /// Tensors outside `prefix.`, keys unchanged.
    pub fn component_without(&self, prefix: &str) -> HashMap<String, Tensor> {
        let head = format!("{prefix}.");
        self.tensors
            .iter()
            .filter(|(k, _)| !k.starts_with(&head))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Prefix every key with `prefix.`.
pub fn prefixed(prefix: &str, tensors: impl IntoIterator<Item = (String, Tensor)>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .map(|(k, v)| (format!("{prefix}.{k}"), v))
        .collect()
}
