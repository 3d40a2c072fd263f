//! Hypothesis sampling.
//!
//! Two strategies feed the discriminator and reinforcement phases:
//!
//! - [`gumbel_sample`]: perturb the model's logits with Gumbel noise and take
//!   the argmax per position. The noise is returned so the caller can build
//!   the matching relaxed distribution `softmax((logits + g) / tau)`.
//! - [`SearchSampler`]: ask a one-best decoder for each source sentence and
//!   normalize what comes back.
//!
//! Both produce a [`HypothesisSet`] whose first row is BOS and whose mask is
//! a prefix of ones.

use agon_core::rng::{gumbel_noise, TrainRng};
use agon_core::tokens::strip_structural;
use agon_core::{AgonError, Batch, HypothesisSet, OneBestDecoder, BOS, EOS, PAD};
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Which sampler the adversarial and reinforcement phases use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// One-best decoding through [`SearchSampler`].
    #[default]
    Search,
    /// Gumbel-max sampling from gold-conditioned logits.
    Gumbel,
}

/// Output of [`gumbel_sample`].
#[derive(Debug, Clone)]
pub struct GumbelDraw {
    /// Sampled hypotheses.
    pub hypotheses: HypothesisSet,
    /// The `(L, B, V)` noise that was added to the logits.
    pub noise: Tensor,
}

/// Samples one hypothesis per column of `logits` `(L, B, V)`.
///
/// Row 0 is forced to BOS; each length is the index of the first EOS, or
/// `L` when no EOS was drawn.
///
/// # Errors
///
/// Returns [`AgonError::Data`] if `L` is zero and [`AgonError::Internal`]
/// on tensor failures.
pub fn gumbel_sample(logits: &Tensor, rng: &mut TrainRng) -> Result<GumbelDraw, AgonError> {
    let map_err = |e: candle_core::Error| AgonError::internal("gumbel_sample", e);
    let (l, b, v) = logits.dims3().map_err(map_err)?;
    if l == 0 {
        return Err(AgonError::Data {
            message: "gumbel_sample: empty time dimension".to_string(),
        });
    }

    let noise = Tensor::from_vec(gumbel_noise(rng, l * b * v)?, (l, b, v), logits.device())
        .and_then(|n| n.to_dtype(logits.dtype()))
        .map_err(map_err)?;
    let mut ids = (logits.detach() + &noise)
        .and_then(|x| x.argmax(D::Minus1))
        .and_then(|x| x.to_vec2::<u32>())
        .map_err(map_err)?;

    ids[0].iter_mut().for_each(|id| *id = BOS);
    let lengths: Vec<usize> = (0..b)
        .map(|j| (0..l).find(|&t| ids[t][j] == EOS).unwrap_or(l))
        .collect();

    let flat: Vec<u32> = ids.into_iter().flatten().collect();
    let tokens = Tensor::from_vec(flat, (l, b), logits.device()).map_err(map_err)?;
    Ok(GumbelDraw {
        hypotheses: HypothesisSet::from_tensor(tokens, lengths)?,
        noise,
    })
}

/// Brings raw decoder output into hypothesis form.
///
/// A leading BOS is added when missing (or when the output is empty), and
/// the sequence is cut at the first EOS or PAD after it, which drops a
/// trailing EOS.
///
/// # Example
///
/// ```
/// use agon_core::{BOS, EOS};
/// use agon_learn::sampler::normalize_hypothesis;
///
/// assert_eq!(normalize_hypothesis(&[5, 7]), vec![BOS, 5, 7]);
/// assert_eq!(normalize_hypothesis(&[BOS, 5, EOS]), vec![BOS, 5]);
/// assert_eq!(normalize_hypothesis(&[]), vec![BOS]);
/// ```
pub fn normalize_hypothesis(raw: &[u32]) -> Vec<u32> {
    let body = match raw.first() {
        Some(&BOS) => &raw[1..],
        _ => raw,
    };
    let stop = body
        .iter()
        .position(|&t| t == EOS || t == PAD)
        .unwrap_or(body.len());
    std::iter::once(BOS).chain(body[..stop].iter().copied()).collect()
}

/// Search-based sampler over a one-best decoder.
///
/// # Example
///
/// ```
/// use agon_core::{AgonError, Batch, OneBestDecoder, BOS};
/// use agon_learn::sampler::SearchSampler;
/// use candle_core::Device;
///
/// struct Echo;
/// impl OneBestDecoder for Echo {
///     fn translate_one(&self, source: &[u32]) -> Result<Vec<u32>, AgonError> {
///         Ok(source.to_vec())
///     }
/// }
///
/// let batch = Batch::from_pairs(&[(vec![5, 6, 7], vec![8])], &Device::Cpu).unwrap();
/// let hyps = SearchSampler::new(&Echo, 1).sample(&batch, 3).unwrap();
/// assert_eq!(hyps.row(0), &[BOS, 5, 6]);
/// ```
#[derive(Debug)]
pub struct SearchSampler<'d, D: OneBestDecoder + ?Sized> {
    decoder: &'d D,
    threads: usize,
}

impl<'d, D: OneBestDecoder + ?Sized> SearchSampler<'d, D> {
    /// Wraps `decoder`; `threads > 1` decodes a batch on that many scoped
    /// worker threads.
    pub fn new(decoder: &'d D, threads: usize) -> Self {
        Self {
            decoder,
            threads: threads.max(1),
        }
    }

    /// Decodes every example of `batch` and packs the results into a
    /// `(max_len, B)` hypothesis set.
    ///
    /// # Errors
    ///
    /// Propagates decoder failures; returns [`AgonError::Data`] if
    /// `max_len` is zero.
    pub fn sample(&self, batch: &Batch, max_len: usize) -> Result<HypothesisSet, AgonError> {
        let b = batch.batch_size();
        let raw = if self.threads == 1 || b < 2 {
            (0..b)
                .map(|j| self.decode_one(batch, j))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            self.decode_parallel(batch)?
        };
        let columns = raw.iter().map(|r| normalize_hypothesis(r)).collect();
        HypothesisSet::from_columns(columns, max_len, batch.device())
    }

    fn decode_one(&self, batch: &Batch, j: usize) -> Result<Vec<u32>, AgonError> {
        let source = strip_structural(batch.source_tokens(j));
        let out = self.decoder.translate_one(&source)?;
        trace!(
            "sample {j}: src={:?} ref={:?} hyp={:?}",
            source,
            batch.reference_tokens(j),
            out
        );
        Ok(out)
    }

    fn decode_parallel(&self, batch: &Batch) -> Result<Vec<Vec<u32>>, AgonError> {
        let b = batch.batch_size();
        let chunk = b.div_ceil(self.threads);
        let indices: Vec<usize> = (0..b).collect();
        let parts: Vec<Result<Vec<Vec<u32>>, AgonError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = indices
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|&j| self.decode_one(batch, j))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(AgonError::Internal {
                            message: "search sampler worker panicked".to_string(),
                        })
                    })
                })
                .collect()
        });
        let mut out = Vec::with_capacity(b);
        for part in parts {
            out.extend(part?);
        }
        Ok(out)
    }
}
