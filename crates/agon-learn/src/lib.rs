//! # agon-learn
//!
//! Hybrid fine-tuning of a translation model: an adversarial divergence
//! between gold-conditioned and hypothesis-conditioned predictions, a
//! pairwise BLEU-correlation reward, and ordinary maximum likelihood,
//! interleaved batch by batch.
//!
//! ## Key Components
//!
//! - [`distance::distance`]: masked JS / KL / gold-token KL divergence
//! - [`padding::align`]: uniform rows past each hypothesis' end
//! - [`sampler`]: Gumbel-max and search-based hypothesis sampling
//! - [`correlation::PairwiseCorrelation`]: confidence vs. reward ranking loss
//! - [`shard::sharded_cross_entropy`]: cross-entropy backward in time shards
//! - [`optim::PhaseOptimizer`]: per-phase update rule, clipping, LR decay
//! - [`probe::bleu_probe`]: start-of-epoch saturation check
//! - [`trainer::Trainer`]: the three-phase loop
//! - [`config::TrainConfig`]: every knob, loaded from TOML or JSON
//!
//! ## Architecture Rules
//!
//! - The losses, samplers and [`trainer::Trainer`] are generic over the
//!   `agon-core` traits. `agon-model` and `agon-translate` appear in
//!   library code only as the model and corpus sections of
//!   [`config::RunConfig`]; the concrete model, decoder and scorer are
//!   built by the `train-agon` binary and the tests.
//! - One [`params::ParameterStore`]; all optimizers update the same
//!   variables, strictly one after another.
//! - Only search decoding fans out over threads.

pub mod checkpoint;
pub mod config;
pub mod correlation;
pub mod distance;
pub mod optim;
pub mod padding;
pub mod params;
pub mod probe;
pub mod sampler;
pub mod shard;
pub mod trainer;

pub use config::{RunConfig, TrainConfig};
pub use params::ParameterStore;
pub use trainer::{TrainOutcome, TrainReport, Trainer};
