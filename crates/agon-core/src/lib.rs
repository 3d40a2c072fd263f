//! # agon-core
//!
//! Shared vocabulary of the agon workspace: the error type, reserved token
//! ids, the time-major [`Batch`], the [`HypothesisSet`] produced by both
//! sampling strategies, seeded randomness helpers, and the collaborator traits
//! the trainer is generic over.
//!
//! ## Key Types
//!
//! - [`AgonError`]: single error enum for every crate
//! - [`Batch`]: immutable `(L, B)` source/target batch
//! - [`HypothesisSet`]: padded hypotheses + monotone mask + lengths
//! - [`rng`]: seeded `StdRng`, permutations and Gumbel noise
//! - [`TranslationModel`], [`ProbabilityHead`], [`OneBestDecoder`],
//!   [`SentenceScorer`]: plug-in seams
//!
//! ## Architecture Rules
//!
//! - No training logic here; only data types and contracts.
//! - Depends on `candle-core` for tensors, never on `candle-nn`.
//! - Tensors are time-major: dimension 0 is time, dimension 1 is batch.

pub mod batch;
pub mod error;
pub mod hypothesis;
pub mod rng;
pub mod tokens;
pub mod traits;

pub use batch::Batch;
pub use error::AgonError;
pub use hypothesis::HypothesisSet;
pub use tokens::{BOS, EOS, EPSILON, PAD, UNK};
pub use traits::{OneBestDecoder, ProbabilityHead, SentenceScorer, TranslationModel};
