//! Checkpoint files.
//!
//! A checkpoint is three files sharing one stem: model weights and
//! classifier weights as safetensors, plus a JSON record with the epoch,
//! batch and optimizer schedules.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use agon_core::AgonError;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::optim::OptimizerState;
use crate::params::{ParameterStore, CLASSIFIER_PREFIX, MODEL_PREFIX};

/// Where and how often checkpoints are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Path prefix of every checkpoint file (default: "checkpoints/agon").
    pub prefix: PathBuf,
    /// Overwrite a single checkpoint instead of one per save (default: true).
    pub save_one_model: bool,
    /// Also save at the end of every epoch, not only on validation
    /// improvements (default: false).
    pub save_every_epoch: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("checkpoints/agon"),
            save_one_model: true,
            save_every_epoch: false,
        }
    }
}

impl CheckpointConfig {
    /// File stem for a checkpoint taken at `epoch`, `batch`.
    ///
    /// # Example
    ///
    /// ```
    /// use agon_learn::checkpoint::CheckpointConfig;
    /// use std::path::PathBuf;
    ///
    /// let config = CheckpointConfig {
    ///     prefix: PathBuf::from("out/run"),
    ///     save_one_model: false,
    ///     ..CheckpointConfig::default()
    /// };
    /// assert_eq!(config.stem(3, 120), PathBuf::from("out/run_e3_upd120"));
    /// ```
    pub fn stem(&self, epoch: usize, batch: usize) -> PathBuf {
        if self.save_one_model {
            self.prefix.clone()
        } else {
            let mut name = self.prefix.as_os_str().to_os_string();
            name.push(format!("_e{epoch}_upd{batch}"));
            PathBuf::from(name)
        }
    }
}

/// Non-tensor part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Epoch in which the checkpoint was taken.
    pub epoch: usize,
    /// Batch index within that epoch.
    pub batch: usize,
    /// Validation BLEU at save time, if validation ran.
    pub valid_bleu: Option<f32>,
    /// Optimizer schedules keyed by phase name.
    pub optimizers: BTreeMap<String, OptimizerState>,
}

/// The three paths of a checkpoint stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Encoder/decoder weights.
    pub model: PathBuf,
    /// Classifier weights.
    pub classifier: PathBuf,
    /// JSON record.
    pub record: PathBuf,
}

impl CheckpointPaths {
    /// Paths for `stem`.
    pub fn for_stem(stem: &Path) -> Self {
        let with = |suffix: &str| {
            let mut s = stem.as_os_str().to_os_string();
            s.push(suffix);
            PathBuf::from(s)
        };
        Self {
            model: with(".model.safetensors"),
            classifier: with(".classifier.safetensors"),
            record: with(".json"),
        }
    }
}

/// Writes the store and `record` under `stem`, creating parent directories.
///
/// # Errors
///
/// Returns [`AgonError::Io`] if a file cannot be written and
/// [`AgonError::Checkpoint`] if serialization fails.
pub fn save(store: &ParameterStore, record: &CheckpointRecord, stem: &Path) -> Result<CheckpointPaths, AgonError> {
    let paths = CheckpointPaths::for_stem(stem);
    if let Some(parent) = stem.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| AgonError::io(parent, e))?;
    }
    for (prefix, path) in [(MODEL_PREFIX, &paths.model), (CLASSIFIER_PREFIX, &paths.classifier)] {
        let tensors = store.named_tensors(prefix)?;
        candle_core::safetensors::save(&tensors, path).map_err(|e| AgonError::io(path, e))?;
    }
    let json = serde_json::to_string_pretty(record).map_err(|e| AgonError::Checkpoint {
        message: format!("encode record: {e}"),
    })?;
    std::fs::write(&paths.record, json).map_err(|e| AgonError::io(&paths.record, e))?;
    info!(
        "saved checkpoint {} (epoch {}, batch {})",
        stem.display(),
        record.epoch,
        record.batch
    );
    Ok(paths)
}

/// Loads the weights under `stem` into `store` and returns the record.
///
/// # Errors
///
/// Returns [`AgonError::Io`] if a file cannot be read and
/// [`AgonError::Checkpoint`] if its contents do not match the store.
pub fn load(store: &ParameterStore, stem: &Path, device: &Device) -> Result<CheckpointRecord, AgonError> {
    let paths = CheckpointPaths::for_stem(stem);
    for (prefix, path) in [(MODEL_PREFIX, &paths.model), (CLASSIFIER_PREFIX, &paths.classifier)] {
        let tensors = candle_core::safetensors::load(path, device).map_err(|e| AgonError::io(path, e))?;
        store.assign(prefix, &tensors)?;
    }
    let text = std::fs::read_to_string(&paths.record).map_err(|e| AgonError::io(&paths.record, e))?;
    let record = serde_json::from_str(&text).map_err(|e| AgonError::Checkpoint {
        message: format!("decode {}: {e}", paths.record.display()),
    })?;
    info!("restored checkpoint {}", stem.display());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agon_model::{RnnSearch, RnnSearchConfig};

    fn store() -> ParameterStore {
        let store = ParameterStore::new();
        RnnSearch::new(store.var_map(), &RnnSearchConfig::tiny(10, 10), &Device::Cpu).unwrap();
        store
    }

    #[test]
    fn stem_naming() {
        let one = CheckpointConfig {
            prefix: PathBuf::from("m"),
            ..CheckpointConfig::default()
        };
        assert_eq!(one.stem(1, 2), PathBuf::from("m"));
        let many = CheckpointConfig {
            save_one_model: false,
            ..one
        };
        assert_eq!(many.stem(1, 2), PathBuf::from("m_e1_upd2"));
        let paths = CheckpointPaths::for_stem(Path::new("m_e1_upd2"));
        assert_eq!(paths.record, PathBuf::from("m_e1_upd2.json"));
        assert_eq!(paths.model, PathBuf::from("m_e1_upd2.model.safetensors"));
    }

    #[test]
    fn save_then_load_restores_weights_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("nested").join("ckpt");
        let a = store();
        let mut optimizers = BTreeMap::new();
        optimizers.insert(
            "supervised".to_string(),
            OptimizerState {
                learning_rate: 0.25,
                decaying: true,
                last_valid_bleu: Some(0.3),
                steps: 12,
            },
        );
        let record = CheckpointRecord {
            epoch: 2,
            batch: 7,
            valid_bleu: Some(0.3),
            optimizers,
        };
        save(&a, &record, &stem).unwrap();

        let b = store();
        let restored = load(&b, &stem, &Device::Cpu).unwrap();
        assert_eq!(restored, record);
        for prefix in [MODEL_PREFIX, CLASSIFIER_PREFIX] {
            let want = a.named_tensors(prefix).unwrap();
            for (name, t) in b.named_tensors(prefix).unwrap() {
                assert_eq!(
                    t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                    want[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
                );
            }
        }
    }

    #[test]
    fn load_missing_files_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&store(), &dir.path().join("absent"), &Device::Cpu);
        assert!(matches!(err, Err(AgonError::Io { .. })));
    }
}
