//! # agon-model
//!
//! Reference implementations of the collaborator traits from `agon-core`,
//! written against candle so that every parameter lives in one
//! [`candle_nn::VarMap`] and receives gradients from all three training
//! phases.
//!
//! ## Key Components
//!
//! - [`RnnSearch`]: bidirectional GRU encoder, additive attention,
//!   two-stage GRU decoder with maxout (or tanh) output features
//! - [`Classifier`]: linear projection to the target vocabulary with plain
//!   and Gumbel-relaxed softmax
//! - [`GreedyDecoder`]: one-best decoding for search-based sampling
//!
//! ## Architecture Rules
//!
//! - All tensors are time-major `(L, B, ..)`.
//! - Parameters are created through `VarBuilder::from_varmap`, prefixed
//!   `model.` for the network and `classifier.` for the output head.
//! - No training logic; losses and optimizers live in `agon-learn`.

pub use agon_core;

mod attention;
mod classifier;
mod config;
mod greedy;
mod gru;
mod rnnsearch;

pub use classifier::Classifier;
pub use config::RnnSearchConfig;
pub use greedy::GreedyDecoder;
pub use rnnsearch::{EncoderState, RnnSearch};
