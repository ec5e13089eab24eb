//! When to save at epoch end, and the file operations that do it
//!
//! The policy only decides. `EmbeddingCheckpointer` persists and evicts
//! embedding files and training-state directories.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::optimizer::AdamWState;
use crate::embeddings::weight_codec::{atomic_write, save_named_tensors};
use crate::embeddings::{save_weights, EMBEDDING_KEY};

const STATE_EMBEDDINGS: &str = "embeddings.safetensors";
const STATE_OPTIMIZER: &str = "optimizer.safetensors";
const STATE_JSON: &str = "train_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochAction {
    Skip,
    Save {
        /// Older epoch embedding file to remove
        evict: Option<usize>,
        /// Older epoch state directory to remove, when states are saved
        evict_state: Option<usize>,
        save_state: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EpochSavePolicy {
    every_n_epochs: Option<usize>,
    keep_last: Option<usize>,
    save_state: bool,
    keep_last_state: Option<usize>,
    num_train_epochs: usize,
}

impl EpochSavePolicy {
    pub fn new(
        every_n_epochs: Option<usize>,
        keep_last: Option<usize>,
        save_state: bool,
        keep_last_state: Option<usize>,
        num_train_epochs: usize,
    ) -> Self {
        Self {
            every_n_epochs: every_n_epochs.filter(|&n| n > 0),
            keep_last: keep_last.filter(|&n| n > 0),
            save_state,
            keep_last_state: keep_last_state.filter(|&n| n > 0),
            num_train_epochs,
        }
    }

    /// `epoch_no` is 1-based. The final epoch is left to the "last" save.
    pub fn decide(&self, epoch_no: usize) -> EpochAction {
        let Some(every) = self.every_n_epochs else {
            return EpochAction::Skip;
        };
        if epoch_no == 0 || epoch_no % every != 0 || epoch_no >= self.num_train_epochs {
            return EpochAction::Skip;
        }

        let older = |keep: Option<usize>| {
            keep.and_then(|k| epoch_no.checked_sub(every * k))
                .filter(|&e| e > 0)
        };
        EpochAction::Save {
            evict: older(self.keep_last),
            evict_state: if self.save_state {
                older(self.keep_last_state)
            } else {
                None
            },
            save_state: self.save_state,
        }
    }
}

/// Progress recorded next to a saved state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    pub seed: u64,
    pub token_string: String,
    pub num_vectors_per_token: usize,
}

/// A state directory read back from disk
pub struct LoadedState {
    pub state: TrainingState,
    pub embeddings: Tensor,
    pub optimizer: Option<AdamWState>,
}

pub struct EmbeddingCheckpointer {
    output_dir: PathBuf,
    model_name: String,
    extension: String,
    save_dtype: Option<DType>,
}

impl EmbeddingCheckpointer {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        model_name: impl Into<String>,
        extension: impl Into<String>,
        save_dtype: Option<DType>,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;
        Ok(Self {
            output_dir,
            model_name: model_name.into(),
            extension: extension.into(),
            save_dtype,
        })
    }

    /// `<name>-<epoch:06>.<ext>`, or `<name>.<ext>` for the last save
    pub fn embedding_path(&self, epoch: Option<usize>) -> PathBuf {
        let file = match epoch {
            Some(epoch) => format!("{}-{:06}.{}", self.model_name, epoch, self.extension),
            None => format!("{}.{}", self.model_name, self.extension),
        };
        self.output_dir.join(file)
    }

    /// `<name>-<epoch:06>-state`, or `<name>-state` for the last save
    pub fn state_dir(&self, epoch: Option<usize>) -> PathBuf {
        let dir = match epoch {
            Some(epoch) => format!("{}-{:06}-state", self.model_name, epoch),
            None => format!("{}-state", self.model_name),
        };
        self.output_dir.join(dir)
    }

    pub fn persist(&self, epoch: Option<usize>, rows: &Tensor) -> Result<PathBuf> {
        let path = self.embedding_path(epoch);
        save_weights(&path, rows, self.save_dtype)
            .with_context(|| format!("Failed to save embeddings to {}", path.display()))?;
        Ok(path)
    }

    pub fn evict(&self, epoch: usize) -> Result<()> {
        let path = self.embedding_path(Some(epoch));
        if path.exists() {
            info!("removing old checkpoint: {}", path.display());
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn save_state(
        &self,
        epoch: Option<usize>,
        state: &TrainingState,
        rows: &Tensor,
        optimizer: Option<&AdamWState>,
    ) -> Result<PathBuf> {
        let dir = self.state_dir(epoch);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state dir {}", dir.display()))?;

        let rows = rows.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
        save_named_tensors(&dir.join(STATE_EMBEDDINGS), &[(EMBEDDING_KEY, &rows)])?;

        if let Some(opt) = optimizer {
            let m = opt.exp_avg.to_device(&Device::Cpu)?;
            let v = opt.exp_avg_sq.to_device(&Device::Cpu)?;
            save_named_tensors(&dir.join(STATE_OPTIMIZER), &[("exp_avg", &m), ("exp_avg_sq", &v)])?;
        }

        atomic_write(&dir.join(STATE_JSON), serde_json::to_string_pretty(state)?.as_bytes())?;
        info!("saving state at epoch {}: {}", state.epoch, dir.display());
        Ok(dir)
    }

    pub fn evict_state(&self, epoch: usize) -> Result<()> {
        let dir = self.state_dir(Some(epoch));
        if dir.exists() {
            info!("removing old state: {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

pub fn load_state(dir: &Path, device: &Device) -> Result<LoadedState> {
    let json_path = dir.join(STATE_JSON);
    let json = fs::read_to_string(&json_path)
        .with_context(|| format!("Failed to read training state {}", json_path.display()))?;
    let state: TrainingState = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse training state {}", json_path.display()))?;

    let mut tensors = candle_core::safetensors::load(dir.join(STATE_EMBEDDINGS), device)?;
    let Some(embeddings) = tensors.remove(EMBEDDING_KEY) else {
        bail!("state {} has no {} tensor", dir.display(), EMBEDDING_KEY);
    };

    let optimizer_path = dir.join(STATE_OPTIMIZER);
    let optimizer = if optimizer_path.is_file() {
        let mut moments = candle_core::safetensors::load(&optimizer_path, device)?;
        match (moments.remove("exp_avg"), moments.remove("exp_avg_sq")) {
            (Some(exp_avg), Some(exp_avg_sq)) => Some(AdamWState {
                step: state.optimizer_step,
                exp_avg,
                exp_avg_sq,
            }),
            _ => bail!("optimizer state {} is incomplete", optimizer_path.display()),
        }
    } else {
        warn!("no optimizer state in {}, moments start from zero", dir.display());
        None
    };

    Ok(LoadedState {
        state,
        embeddings,
        optimizer,
    })
}
