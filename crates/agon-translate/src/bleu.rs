//! BLEU over token ids.
//!
//! Clipped n-gram precision up to order 4 with the standard brevity
//! penalty. Sentence scores use add-one smoothing on orders above one so
//! short hypotheses still receive a graded reward; corpus scores aggregate
//! raw counts and are unsmoothed.

use std::collections::HashMap;

use agon_core::SentenceScorer;

/// BLEU scorer.
///
/// # Example
///
/// ```
/// use agon_core::SentenceScorer;
/// use agon_translate::Bleu;
///
/// let bleu = Bleu::default();
/// let perfect = bleu.sentence_bleu(&[4, 5, 6, 7, 8], &[4, 5, 6, 7, 8]);
/// assert!((perfect - 1.0).abs() < 1e-6);
/// assert_eq!(bleu.sentence_bleu(&[], &[4, 5]), 0.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Bleu {
    /// Highest n-gram order (default: 4).
    pub max_order: usize,
    /// Add-one smoothing for sentence-level orders above one (default: true).
    pub smooth_sentences: bool,
}

impl Default for Bleu {
    fn default() -> Self {
        Self {
            max_order: 4,
            smooth_sentences: true,
        }
    }
}

/// Clipped matches and candidate totals per order, plus lengths.
#[derive(Debug, Clone, Default)]
struct Stats {
    matches: Vec<u64>,
    totals: Vec<u64>,
    hyp_len: u64,
    ref_len: u64,
}

impl Stats {
    fn new(max_order: usize) -> Self {
        Self {
            matches: vec![0; max_order],
            totals: vec![0; max_order],
            hyp_len: 0,
            ref_len: 0,
        }
    }

    fn add(&mut self, hyp: &[u32], reference: &[u32]) {
        let max_order = self.matches.len();
        self.hyp_len += hyp.len() as u64;
        self.ref_len += reference.len() as u64;
        for n in 1..=max_order {
            let ref_counts = ngram_counts(reference, n);
            let hyp_counts = ngram_counts(hyp, n);
            let clipped: u64 = hyp_counts
                .iter()
                .map(|(gram, &c)| c.min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum();
            self.matches[n - 1] += clipped;
            self.totals[n - 1] += hyp.len().saturating_sub(n - 1) as u64;
        }
    }

    fn score(&self, smooth: bool) -> f32 {
        if self.hyp_len == 0 {
            return 0.0;
        }
        let max_order = self.matches.len();
        let mut log_sum = 0.0f64;
        for n in 0..max_order {
            let (m, t) = if smooth && n > 0 {
                (self.matches[n] + 1, self.totals[n] + 1)
            } else {
                (self.matches[n], self.totals[n])
            };
            if m == 0 || t == 0 {
                return 0.0;
            }
            log_sum += (m as f64 / t as f64).ln();
        }
        let precision = (log_sum / max_order as f64).exp();
        let bp = if self.hyp_len >= self.ref_len {
            1.0
        } else {
            (1.0 - self.ref_len as f64 / self.hyp_len as f64).exp()
        };
        (bp * precision) as f32
    }
}

fn ngram_counts(tokens: &[u32], n: usize) -> HashMap<&[u32], u64> {
    let mut counts = HashMap::new();
    if n == 0 || tokens.len() < n {
        return counts;
    }
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

impl SentenceScorer for Bleu {
    fn sentence_bleu(&self, hypothesis: &[u32], reference: &[u32]) -> f32 {
        let mut stats = Stats::new(self.max_order);
        stats.add(hypothesis, reference);
        stats.score(self.smooth_sentences)
    }

    fn corpus_bleu(&self, hypotheses: &[Vec<u32>], references: &[Vec<u32>]) -> f32 {
        let mut stats = Stats::new(self.max_order);
        for (hyp, reference) in hypotheses.iter().zip(references) {
            stats.add(hyp, reference);
        }
        stats.score(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn disjoint_is_zero() {
        let bleu = Bleu::default();
        assert_eq!(bleu.sentence_bleu(&[1, 2, 3, 4], &[5, 6, 7, 8]), 0.0);
    }

    #[test]
    fn brevity_penalty_applies() {
        let bleu = Bleu {
            max_order: 1,
            smooth_sentences: false,
        };
        // all unigrams match, hyp half as long as ref: exp(1 - 2)
        let score = bleu.sentence_bleu(&[4, 5], &[4, 5, 6, 7]);
        assert_relative_eq!(score, (-1.0f32).exp(), epsilon = 1e-6);
    }

    #[test]
    fn clipping_limits_repeats() {
        let bleu = Bleu {
            max_order: 1,
            smooth_sentences: false,
        };
        let score = bleu.sentence_bleu(&[4, 4, 4, 4], &[4, 5, 6, 7]);
        assert_relative_eq!(score, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn corpus_aggregates_counts() {
        let bleu = Bleu::default();
        let hyps = vec![vec![4, 5, 6, 7, 8], vec![9, 10, 11, 12]];
        let refs = hyps.clone();
        assert_relative_eq!(bleu.corpus_bleu(&hyps, &refs), 1.0, epsilon = 1e-6);
        let bad = vec![vec![20, 21], vec![22]];
        assert_eq!(bleu.corpus_bleu(&bad, &refs), 0.0);
    }

    #[test]
    fn better_overlap_scores_higher() {
        let bleu = Bleu::default();
        let reference = [4, 5, 6, 7, 8, 9];
        let close = bleu.sentence_bleu(&[4, 5, 6, 7, 8, 10], &reference);
        let far = bleu.sentence_bleu(&[4, 11, 6, 12, 8, 10], &reference);
        assert!(close > far, "close={close} far={far}");
    }
}
