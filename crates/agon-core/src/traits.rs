//! Collaborator contracts the trainer is written against.
//!
//! The trainer never names a concrete network, decoder or metric. Anything
//! implementing these traits can be plugged in; `agon-model` and
//! `agon-translate` ship the default implementations.

use candle_core::Tensor;

use crate::error::AgonError;

/// Maps decoder features to vocabulary scores.
pub trait ProbabilityHead {
    /// Target vocabulary size `V`.
    fn vocab_size(&self) -> usize;

    /// Unnormalized scores `(L, B, V)` for features `(L, B, H)`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    fn logits(&self, features: &Tensor) -> Result<Tensor, AgonError>;

    /// Probabilities `softmax((logits + noise) / temperature)` over `V`.
    ///
    /// `noise` and `temperature` are only given on the relaxed Gumbel path;
    /// without them this is a plain softmax.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    fn to_probabilities(
        &self,
        features: &Tensor,
        noise: Option<&Tensor>,
        temperature: Option<f64>,
    ) -> Result<Tensor, AgonError>;
}

/// Sequence-to-sequence network run over a given target prefix.
pub trait TranslationModel {
    /// Output head paired with this network.
    type Head: ProbabilityHead;

    /// Runs the decoder over `trg_prefix` `(L, B)` conditioned on `src`
    /// `(Ls, B)` and returns pre-classifier features `(L, B, H)`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures and
    /// [`AgonError::ShapeMismatch`] when masks and ids disagree.
    fn forward(
        &self,
        src: &Tensor,
        trg_prefix: &Tensor,
        src_mask: &Tensor,
        trg_mask: &Tensor,
    ) -> Result<Tensor, AgonError>;

    /// The output head.
    fn classifier(&self) -> &Self::Head;
}

/// Produces a single best translation for one source sentence.
pub trait OneBestDecoder: Sync {
    /// Decodes the pad-free `source` ids. The output may or may not start
    /// with BOS or end with EOS; callers normalize it.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    fn translate_one(&self, source: &[u32]) -> Result<Vec<u32>, AgonError>;
}

/// Sentence- and corpus-level BLEU over token ids, in `[0, 1]`.
pub trait SentenceScorer: Sync {
    /// BLEU of one hypothesis against one reference.
    fn sentence_bleu(&self, hypothesis: &[u32], reference: &[u32]) -> f32;

    /// Corpus BLEU of aligned hypothesis/reference lists.
    fn corpus_bleu(&self, hypotheses: &[Vec<u32>], references: &[Vec<u32>]) -> f32;
}
