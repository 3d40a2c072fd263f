//! Training configuration.
//!
//! [`TrainConfig`] is everything the orchestrator needs and is frozen once
//! the [`crate::trainer::Trainer`] is built. [`RunConfig`] adds the model
//! shape and data locations for the `train-agon` binary. Both load from
//! TOML or JSON, chosen by file extension.

use std::path::{Path, PathBuf};

use agon_core::AgonError;
use agon_model::RnnSearchConfig;
use agon_translate::CorpusConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointConfig;
use crate::distance::DistanceKind;
use crate::optim::OptimConfig;
use crate::sampler::SamplingStrategy;
use crate::shard::{Normalization, ShardOptions};

/// How hypotheses are drawn for the adversarial and reinforcement phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Search decoding or Gumbel-max sampling (default: search).
    pub strategy: SamplingStrategy,
    /// Temperature of the relaxed Gumbel distribution (default: 1.0).
    pub gumbel_temperature: f64,
    /// Worker threads for search decoding (default: 1).
    pub decode_threads: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::Search,
            gumbel_temperature: 1.0,
            decode_threads: 1,
        }
    }
}

/// Start-of-epoch BLEU probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Fraction of training batches decoded (default: 0.1).
    pub percentage: f64,
    /// Probe BLEU above which training stops as saturated (default: 0.9).
    pub bleu_threshold: f32,
    /// Decoding length cap for probe hypotheses (default: 100).
    pub max_len: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            percentage: 0.1,
            bleu_threshold: 0.9,
            max_len: 100,
        }
    }
}

/// Configuration of the three-phase fine-tuning loop.
///
/// # Example
///
/// ```
/// use agon_learn::config::TrainConfig;
///
/// let config = TrainConfig::default();
/// assert_eq!(config.supervised_iters, 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// First epoch number (default: 1).
    pub start_epoch: usize,
    /// Last epoch number, inclusive (default: 10).
    pub max_epochs: usize,

    /// Discriminator updates per batch (default: 1).
    pub discriminator_iters: usize,
    /// Supervised updates per batch (default: 4).
    pub supervised_iters: usize,
    /// Reinforcement updates per batch (default: 1).
    pub reinforce_iters: usize,

    /// Divergence minimized by the discriminator phase (default: KL).
    pub distance: DistanceKind,
    /// Hypothesis sampling.
    pub sampling: SamplingConfig,

    /// Time steps per cross-entropy shard (default: 100).
    pub shard_size: usize,
    /// Cross-entropy scaling (default: sentences).
    pub normalization: Normalization,
    /// Label smoothing for the supervised phase (default: 0.0).
    pub label_smoothing: f64,

    /// Sharpness of the BLEU reward softmax (default: 5.0).
    pub reward_sharpness: f64,

    /// BLEU probe.
    pub probe: ProbeConfig,

    /// Discriminator optimizer.
    pub discriminator: OptimConfig,
    /// Supervised optimizer.
    pub supervised: OptimConfig,
    /// Reinforcement optimizer.
    pub reinforcement: OptimConfig,

    /// Checkpointing.
    pub checkpoint: CheckpointConfig,

    /// Seed for probe selection and Gumbel noise (default: 1234).
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            start_epoch: 1,
            max_epochs: 10,
            discriminator_iters: 1,
            supervised_iters: 4,
            reinforce_iters: 1,
            distance: DistanceKind::Kl,
            sampling: SamplingConfig::default(),
            shard_size: 100,
            normalization: Normalization::Sentences,
            label_smoothing: 0.0,
            reward_sharpness: 5.0,
            probe: ProbeConfig::default(),
            discriminator: OptimConfig::default(),
            supervised: OptimConfig::default(),
            reinforcement: OptimConfig::default(),
            checkpoint: CheckpointConfig::default(),
            seed: 1234,
        }
    }
}

impl TrainConfig {
    /// Loads a config from a `.json` or `.toml` file.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] if the file cannot be read and
    /// [`AgonError::InvalidConfig`] if it does not parse.
    pub fn from_path(path: &Path) -> Result<Self, AgonError> {
        read_document(path)
    }

    /// Cross-entropy options derived from this config.
    pub fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            shard_size: self.shard_size,
            normalization: self.normalization,
            label_smoothing: self.label_smoothing,
        }
    }

    /// Checks ranges and consistency.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<(), AgonError> {
        let bad = |message: String| Err(AgonError::InvalidConfig { message });
        if self.start_epoch > self.max_epochs {
            return bad(format!(
                "start_epoch {} is after max_epochs {}",
                self.start_epoch, self.max_epochs
            ));
        }
        if self.shard_size == 0 {
            return bad("shard_size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return bad(format!("label_smoothing must be in [0, 1), got {}", self.label_smoothing));
        }
        if !(self.reward_sharpness.is_finite() && self.reward_sharpness > 0.0) {
            return bad(format!("reward_sharpness must be positive, got {}", self.reward_sharpness));
        }
        if !(self.sampling.gumbel_temperature > 0.0) {
            return bad(format!(
                "gumbel_temperature must be positive, got {}",
                self.sampling.gumbel_temperature
            ));
        }
        if self.sampling.decode_threads == 0 {
            return bad("decode_threads must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.probe.percentage) {
            return bad(format!("probe.percentage must be in [0, 1], got {}", self.probe.percentage));
        }
        if self.probe.max_len == 0 {
            return bad("probe.max_len must be positive".to_string());
        }
        self.discriminator.validate()?;
        self.supervised.validate()?;
        self.reinforcement.validate()
    }
}

/// Data locations and batching for the `train-agon` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Training source text, one sentence per line.
    pub train_src: PathBuf,
    /// Training target text, aligned with `train_src`.
    pub train_trg: PathBuf,
    /// Optional validation source text.
    pub valid_src: Option<PathBuf>,
    /// Optional validation target text.
    pub valid_trg: Option<PathBuf>,
    /// Source vocabulary file, created from `train_src` if absent.
    pub src_vocab: PathBuf,
    /// Target vocabulary file, created from `train_trg` if absent.
    pub trg_vocab: PathBuf,
    /// Source vocabulary cap including specials (default: 30000).
    pub src_vocab_size: usize,
    /// Target vocabulary cap including specials (default: 30000).
    pub trg_vocab_size: usize,
    /// Sentences per batch (default: 80).
    pub batch_size: usize,
    /// Longest sentence kept, in tokens (default: 50).
    pub max_seq_len: usize,
    /// Shuffle before batching (default: true).
    pub shuffle: bool,
    /// Sort by source length before batching (default: true).
    pub sort_by_length: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        let corpus = CorpusConfig::default();
        Self {
            train_src: PathBuf::from("data/train.src"),
            train_trg: PathBuf::from("data/train.trg"),
            valid_src: None,
            valid_trg: None,
            src_vocab: PathBuf::from("data/src.vocab"),
            trg_vocab: PathBuf::from("data/trg.vocab"),
            src_vocab_size: 30_000,
            trg_vocab_size: 30_000,
            batch_size: 80,
            max_seq_len: corpus.max_seq_len,
            shuffle: corpus.shuffle,
            sort_by_length: corpus.sort_by_length,
        }
    }
}

impl DataConfig {
    /// Corpus loading options, seeded with `seed`.
    pub fn corpus_config(&self, seed: u64) -> CorpusConfig {
        CorpusConfig {
            max_seq_len: self.max_seq_len,
            shuffle: self.shuffle,
            sort_by_length: self.sort_by_length,
            seed,
        }
    }
}

/// Everything the `train-agon` binary reads from its config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Reference model shape. Vocabulary sizes are overwritten with the
    /// sizes of the loaded vocabularies.
    pub model: RnnSearchConfig,
    /// Data locations.
    pub data: DataConfig,
    /// Training loop.
    pub train: TrainConfig,
}

impl RunConfig {
    /// Loads a config from a `.json` or `.toml` file.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] if the file cannot be read and
    /// [`AgonError::InvalidConfig`] if it does not parse.
    pub fn from_path(path: &Path) -> Result<Self, AgonError> {
        read_document(path)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<(), AgonError> {
        if self.data.batch_size == 0 {
            return Err(AgonError::InvalidConfig {
                message: "data.batch_size must be positive".to_string(),
            });
        }
        if self.data.valid_src.is_some() != self.data.valid_trg.is_some() {
            return Err(AgonError::InvalidConfig {
                message: "valid_src and valid_trg must be given together".to_string(),
            });
        }
        self.train.validate()
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, AgonError> {
    let content = std::fs::read_to_string(path).map_err(|e| AgonError::io(path, e))?;
    let parsed = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        toml::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| AgonError::InvalidConfig {
        message: format!("{}: {message}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        TrainConfig::default().validate().unwrap();
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "max_epochs = 3\ndistance = \"js\"\n\n[sampling]\nstrategy = \"gumbel\"\n\n[supervised]\nkind = \"sgd\"\nlearning_rate = 0.5"
        )
        .unwrap();
        let config = TrainConfig::from_path(file.path()).unwrap();
        assert_eq!(config.max_epochs, 3);
        assert_eq!(config.distance, DistanceKind::Js);
        assert_eq!(config.sampling.strategy, SamplingStrategy::Gumbel);
        assert_eq!(config.supervised.learning_rate, 0.5);
        assert_eq!(config.supervised_iters, 4);
        assert_eq!(config.discriminator, OptimConfig::default());
    }

    #[test]
    fn json_run_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"model": {{"dec_hidden": 16}}, "data": {{"batch_size": 2}}, "train": {{"seed": 9}}}}"#
        )
        .unwrap();
        let config = RunConfig::from_path(file.path()).unwrap();
        assert_eq!(config.model.dec_hidden, 16);
        assert_eq!(config.data.batch_size, 2);
        assert_eq!(config.train.seed, 9);
    }

    #[test]
    fn unparseable_file_is_invalid_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_epochs = \"many\"").unwrap();
        assert!(matches!(
            TrainConfig::from_path(file.path()),
            Err(AgonError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn bad_values_are_rejected() {
        let cases = [
            TrainConfig { shard_size: 0, ..TrainConfig::default() },
            TrainConfig { start_epoch: 5, max_epochs: 4, ..TrainConfig::default() },
            TrainConfig { label_smoothing: 1.0, ..TrainConfig::default() },
            TrainConfig {
                probe: ProbeConfig { percentage: 2.0, ..ProbeConfig::default() },
                ..TrainConfig::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err());
        }
    }
}
