//! Pairwise correlation between model confidence and BLEU reward.
//!
//! For every ordered pair `(i, j)` of hypotheses in a batch, the loss pushes
//! the model's relative confidence `c_i / (c_i + c_j)` toward the relative
//! reward `r_i / (r_i + r_j)`, where `r = softmax(lambda * bleu)`.

use agon_core::{AgonError, EPSILON};
use candle_core::{Tensor, D};

/// Mean log-probability of each hypothesis' own tokens.
///
/// `probs` is `(L, B, V)`, `tokens` `(L, B)` u32 and `mask` `(L, B)` f32.
/// Returns a `(B,)` tensor of values `<= 0` that keeps the gradient of
/// `probs`.
///
/// # Errors
///
/// Returns [`AgonError::Internal`] on tensor failures.
pub fn sentence_confidence(probs: &Tensor, tokens: &Tensor, mask: &Tensor) -> Result<Tensor, AgonError> {
    let map_err = |e: candle_core::Error| AgonError::internal("sentence_confidence", e);
    let picked = tokens
        .unsqueeze(D::Minus1)
        .and_then(|idx| probs.gather(&idx, 2))
        .and_then(|p| p.squeeze(2))
        .map_err(map_err)?;
    let log_p = ((picked + EPSILON).map_err(map_err)?.log().map_err(map_err)? * mask).map_err(map_err)?;
    let counts = mask
        .sum(0)
        .and_then(|c| c.clamp(1.0, f64::MAX))
        .map_err(map_err)?;
    log_p.sum(0).and_then(|s| s / counts).map_err(map_err)
}

/// Output of [`PairwiseCorrelation::loss`].
#[derive(Debug, Clone)]
pub struct CorrelationOutput {
    /// Differentiable scalar loss.
    pub loss: Tensor,
    /// Pearson-style correlation between confidence and reward.
    pub rho: f32,
    /// `softmax(lambda * bleu)` per hypothesis.
    pub rewards: Vec<f32>,
}

/// Pairwise BLEU-correlation loss.
///
/// # Example
///
/// ```
/// use agon_learn::correlation::PairwiseCorrelation;
/// use candle_core::{Device, Tensor};
///
/// let confidence = Tensor::new(&[-0.5f32, -2.0, -1.0], &Device::Cpu).unwrap();
/// let out = PairwiseCorrelation::default().loss(&confidence, &[0.6, 0.1, 0.3]).unwrap();
/// assert!(out.loss.to_vec0::<f32>().unwrap().is_finite());
/// assert!(out.rho > 0.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PairwiseCorrelation {
    /// Reward sharpness applied to BLEU before the softmax (default: 5.0).
    pub lambda: f64,
    /// Guard for denominators and logarithms (default: 1e-20).
    pub epsilon: f64,
}

impl Default for PairwiseCorrelation {
    fn default() -> Self {
        Self {
            lambda: 5.0,
            epsilon: EPSILON,
        }
    }
}

impl PairwiseCorrelation {
    /// Softmax of `lambda * bleu`.
    pub fn rewards(&self, bleu: &[f32]) -> Vec<f32> {
        let scaled: Vec<f64> = bleu.iter().map(|&b| self.lambda * b as f64).collect();
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scaled.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.iter().map(|e| (e / total) as f32).collect()
    }

    /// `(E[c r] - E[c] E[r]) / sqrt(Var[c] Var[r] + eps)`.
    pub fn rho(&self, confidence: &[f32], rewards: &[f32]) -> f32 {
        let n = confidence.len().max(1) as f64;
        let mean = |xs: &[f32]| xs.iter().map(|&x| x as f64).sum::<f64>() / n;
        let (ec, er) = (mean(confidence), mean(rewards));
        let ecr = confidence
            .iter()
            .zip(rewards)
            .map(|(&c, &r)| c as f64 * r as f64)
            .sum::<f64>()
            / n;
        let var = |xs: &[f32], m: f64| xs.iter().map(|&x| (x as f64 - m).powi(2)).sum::<f64>() / n;
        ((ecr - ec * er) / (var(confidence, ec) * var(rewards, er) + self.epsilon).sqrt()) as f32
    }

    /// Loss `sum_{i != j} -L_ij` with
    /// `L_ij = c_i/(c_i+c_j) * log(r_j/(r_i+r_j)) + c_j/(c_i+c_j) * log(r_i/(r_i+r_j))`.
    ///
    /// The confidence denominator is shifted by `-epsilon`, since
    /// confidences are non-positive; the reward denominator by `+epsilon`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::ShapeMismatch`] if `confidence` and `bleu`
    /// differ in length, and [`AgonError::Internal`] on tensor failures.
    pub fn loss(&self, confidence: &Tensor, bleu: &[f32]) -> Result<CorrelationOutput, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("PairwiseCorrelation::loss", e);
        let b = confidence.dims1().map_err(map_err)?;
        if b != bleu.len() {
            return Err(AgonError::ShapeMismatch {
                what: "bleu scores".to_string(),
                expected: b,
                actual: bleu.len(),
            });
        }
        let device = confidence.device();
        let rewards = self.rewards(bleu);
        let conf_host = confidence.detach().to_vec1::<f32>().map_err(map_err)?;
        let rho = self.rho(&conf_host, &rewards);

        let dtype = confidence.dtype();
        let r = Tensor::new(rewards.as_slice(), device)
            .and_then(|r| r.to_dtype(dtype))
            .map_err(map_err)?;
        let r_i = r.unsqueeze(1).and_then(|r| r.broadcast_as((b, b))).map_err(map_err)?;
        let r_j = r.unsqueeze(0).and_then(|r| r.broadcast_as((b, b))).map_err(map_err)?;
        let r_sum = ((&r_i + &r_j).map_err(map_err)? + self.epsilon).map_err(map_err)?;
        let toward_j = (&r_j / &r_sum).and_then(|x| x.log()).map_err(map_err)?;
        let toward_i = (&r_i / &r_sum).and_then(|x| x.log()).map_err(map_err)?;
        let off_diag = Tensor::eye(b, dtype, device)
            .and_then(|eye| eye.affine(-1.0, 1.0))
            .map_err(map_err)?;

        let c_i = confidence
            .unsqueeze(1)
            .and_then(|c| c.broadcast_as((b, b)))
            .map_err(map_err)?;
        let c_j = confidence
            .unsqueeze(0)
            .and_then(|c| c.broadcast_as((b, b)))
            .map_err(map_err)?;
        let c_sum = ((&c_i + &c_j).map_err(map_err)? - self.epsilon).map_err(map_err)?;
        let pair = ((c_i * toward_j).map_err(map_err)? + (c_j * toward_i).map_err(map_err)?)
            .map_err(map_err)?;
        let loss = (pair / c_sum)
            .and_then(|l| l * off_diag)
            .and_then(|l| l.sum_all())
            .and_then(|l| l.neg())
            .map_err(map_err)?;

        Ok(CorrelationOutput { loss, rho, rewards })
    }
}
