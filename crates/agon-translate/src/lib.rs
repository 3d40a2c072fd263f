//! # agon-translate
//!
//! Text-side plumbing for translation training.
//!
//! - [`vocab::Vocab`]: frequency-ranked word vocabulary with reserved ids
//! - [`bleu::Bleu`]: BLEU-4 over token ids, sentence and corpus level
//! - [`corpus::ParallelCorpus`]: line-aligned source/target files turned
//!   into length-sorted [`agon_core::Batch`]es
//!
//! ## Architecture Rules
//!
//! - Whitespace tokenization only; subword segmentation happens upstream.
//! - Depends on `agon-core`; no model or training code here.

pub mod bleu;
pub mod corpus;
pub mod vocab;

pub use agon_core;
pub use bleu::Bleu;
pub use corpus::{CorpusConfig, CorpusStats, ParallelCorpus};
pub use vocab::Vocab;
