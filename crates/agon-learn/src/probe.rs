//! Start-of-epoch BLEU probe on a random slice of the training batches.

use agon_core::rng::{permutation, TrainRng};
use agon_core::{AgonError, Batch, OneBestDecoder, SentenceScorer};

use crate::sampler::SearchSampler;

/// Result of [`bleu_probe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    /// Corpus BLEU over every probed sentence.
    pub bleu: f32,
    /// Number of batches decoded.
    pub batches: usize,
    /// Number of sentences decoded.
    pub sentences: usize,
}

/// Decodes `floor(percentage * batches.len())` randomly chosen batches and
/// scores them against their references.
///
/// Hypotheses are compared without their leading BOS, references without
/// BOS and EOS. Returns `None` when the slice is empty.
///
/// # Errors
///
/// Propagates decoder failures.
pub fn bleu_probe<D, S>(
    batches: &[Batch],
    sampler: &SearchSampler<'_, D>,
    scorer: &S,
    percentage: f64,
    max_len: usize,
    rng: &mut TrainRng,
) -> Result<Option<ProbeResult>, AgonError>
where
    D: OneBestDecoder + ?Sized,
    S: SentenceScorer + ?Sized,
{
    let size = ((percentage.clamp(0.0, 1.0) * batches.len() as f64).floor() as usize).min(batches.len());
    if size == 0 {
        return Ok(None);
    }
    let order = permutation(rng, batches.len());
    let mut hypotheses = Vec::new();
    let mut references = Vec::new();
    for &bid in &order[..size] {
        let batch = &batches[bid];
        let hyps = sampler.sample(batch, max_len)?;
        for b in 0..batch.batch_size() {
            hypotheses.push(hyps.content(b).to_vec());
            references.push(batch.reference_tokens(b).to_vec());
        }
    }
    Ok(Some(ProbeResult {
        bleu: scorer.corpus_bleu(&hypotheses, &references),
        batches: size,
        sentences: hypotheses.len(),
    }))
}
