//! Masked divergences between two sequences of distributions.
//!
//! Inputs are `(L, B, V)` probability tensors and an `(L, B)` validity mask.
//! Every variant sums a per-position divergence over valid positions and
//! divides by the batch size. When the two sequences differ in length the
//! longer one (and the mask) is cut to the shorter length; the compared
//! length is reported back.

use agon_core::{AgonError, EPSILON};
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which divergence to compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    /// Jensen-Shannon: mean of `KL(p1 || M)` and `KL(p2 || M)`, `M = (p1 + p2) / 2`.
    Js,
    /// `KL(p1 || p2)` summed over the vocabulary.
    #[default]
    Kl,
    /// KL restricted to the gold token: `p1[g] * (log p1[g] - log p2[g])`.
    KlSent,
}

/// Result of [`distance`].
#[derive(Debug, Clone)]
pub struct Distance {
    /// Differentiable scalar: masked divergence sum / batch size.
    pub loss: Tensor,
    /// Diagnostic: each position divided by the number of valid examples
    /// at its time step before summing, then / batch size.
    pub weighted: f32,
    /// Number of time steps compared.
    pub compared_len: usize,
    /// True when an input was cut to `compared_len`.
    pub truncated: bool,
}

/// Computes a masked divergence between `p1` and `p2`.
///
/// `gold` `(L, B)` u32 is required for [`DistanceKind::KlSent`] and
/// ignored otherwise.
///
/// # Errors
///
/// Returns [`AgonError::ShapeMismatch`] if batch or vocabulary dimensions
/// disagree, [`AgonError::MissingGold`] for `KlSent` without `gold`, and
/// [`AgonError::Internal`] on tensor failures.
///
/// # Example
///
/// ```
/// use agon_learn::distance::{distance, DistanceKind};
/// use candle_core::{Device, Tensor};
///
/// let device = Device::Cpu;
/// let p = Tensor::new(&[[[0.5f32, 0.5]], [[0.9, 0.1]]], &device).unwrap();
/// let mask = Tensor::new(&[[1.0f32], [1.0]], &device).unwrap();
/// let d = distance(&p, &p, &mask, DistanceKind::Kl, None).unwrap();
/// assert_eq!(d.loss.to_vec0::<f32>().unwrap(), 0.0);
/// ```
pub fn distance(
    p1: &Tensor,
    p2: &Tensor,
    mask: &Tensor,
    kind: DistanceKind,
    gold: Option<&Tensor>,
) -> Result<Distance, AgonError> {
    let map_err = |e: candle_core::Error| AgonError::internal("distance", e);
    let (l1, b1, v1) = p1.dims3().map_err(map_err)?;
    let (l2, b2, v2) = p2.dims3().map_err(map_err)?;
    let (lm, bm) = mask.dims2().map_err(map_err)?;

    for (what, actual) in [("p2 batch dimension", b2), ("mask batch dimension", bm)] {
        if actual != b1 {
            return Err(AgonError::ShapeMismatch {
                what: what.to_string(),
                expected: b1,
                actual,
            });
        }
    }
    if v2 != v1 {
        return Err(AgonError::ShapeMismatch {
            what: "vocabulary dimension".to_string(),
            expected: v1,
            actual: v2,
        });
    }

    let gold = match (kind, gold) {
        (DistanceKind::KlSent, None) => return Err(AgonError::MissingGold),
        (DistanceKind::KlSent, Some(g)) => {
            let (lg, bg) = g.dims2().map_err(map_err)?;
            if bg != b1 {
                return Err(AgonError::ShapeMismatch {
                    what: "gold batch dimension".to_string(),
                    expected: b1,
                    actual: bg,
                });
            }
            Some((g, lg))
        }
        _ => None,
    };

    let mut lengths = vec![l1, l2, lm];
    if let Some((_, lg)) = gold {
        lengths.push(lg);
    }
    let len = lengths.iter().copied().min().unwrap_or(0);
    let truncated = lengths.iter().any(|&l| l != len);
    if truncated {
        debug!("distance: comparing {len} steps (p1={l1}, p2={l2}, mask={lm})");
    }

    let p1 = p1.narrow(0, 0, len).map_err(map_err)?;
    let p2 = p2.narrow(0, 0, len).map_err(map_err)?;
    let mask = mask.narrow(0, 0, len).map_err(map_err)?;

    let per_position = match kind {
        DistanceKind::Kl => kl_terms(&p1, &p2).map_err(map_err)?,
        DistanceKind::Js => {
            let m = ((&p1 + &p2).map_err(map_err)? * 0.5).map_err(map_err)?;
            let a = kl_terms(&p1, &m).map_err(map_err)?;
            let b = kl_terms(&p2, &m).map_err(map_err)?;
            ((a + b).map_err(map_err)? * 0.5).map_err(map_err)?
        }
        DistanceKind::KlSent => {
            let (g, _) = gold.ok_or(AgonError::MissingGold)?;
            let idx = g
                .narrow(0, 0, len)
                .and_then(|g| g.unsqueeze(D::Minus1))
                .map_err(map_err)?;
            let g1 = p1.gather(&idx, 2).and_then(|t| t.squeeze(2)).map_err(map_err)?;
            let g2 = p2.gather(&idx, 2).and_then(|t| t.squeeze(2)).map_err(map_err)?;
            let log_ratio = (log_eps(&g1).map_err(map_err)? - log_eps(&g2).map_err(map_err)?)
                .map_err(map_err)?;
            (log_ratio * &g1).map_err(map_err)?
        }
    };

    let masked = (per_position * &mask).map_err(map_err)?;
    let batch = b1 as f64;
    let loss = (masked.sum_all().map_err(map_err)? / batch).map_err(map_err)?;

    let valid_per_step = mask
        .sum_keepdim(1)
        .and_then(|c| c.clamp(1.0, f64::MAX))
        .map_err(map_err)?;
    let weighted = masked
        .detach()
        .broadcast_div(&valid_per_step)
        .and_then(|w| w.sum_all())
        .and_then(|w| w.to_vec0::<f32>())
        .map_err(map_err)?
        / b1 as f32;

    Ok(Distance {
        loss,
        weighted,
        compared_len: len,
        truncated,
    })
}

fn log_eps(p: &Tensor) -> candle_core::Result<Tensor> {
    (p + EPSILON)?.log()
}

/// `sum_v p * (log(p + eps) - log(q + eps))`, shape `(L, B)`.
fn kl_terms(p: &Tensor, q: &Tensor) -> candle_core::Result<Tensor> {
    let log_ratio = (log_eps(p)? - log_eps(q)?)?;
    (p * log_ratio)?.sum(D::Minus1)
}
