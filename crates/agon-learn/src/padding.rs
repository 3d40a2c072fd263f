//! Uniform fill for positions past a hypothesis' end.

use agon_core::hypothesis::length_mask;
use agon_core::AgonError;
use candle_core::{Tensor, D};

/// Returns `probs` `(max_len, B, V)` with every position `t >= lengths[b]`
/// replaced by the uniform distribution `1 / vocab_size`.
///
/// Positions before each length pass through unchanged and keep their
/// gradient; filled positions carry none. The input is left as is.
///
/// # Errors
///
/// Returns [`AgonError::ShapeMismatch`] if `probs` is not
/// `(max_len, batch_size, vocab_size)` or `lengths` is not `batch_size`
/// long.
///
/// # Example
///
/// ```
/// use agon_learn::padding::align;
/// use candle_core::{Device, Tensor};
///
/// let probs = Tensor::new(&[[[1.0f32, 0.0]], [[0.0, 1.0]]], &Device::Cpu).unwrap();
/// let out = align(1, 2, 2, &probs, &[1]).unwrap();
/// assert_eq!(out.to_vec3::<f32>().unwrap(), vec![vec![vec![1.0, 0.0]], vec![vec![0.5, 0.5]]]);
/// ```
pub fn align(
    batch_size: usize,
    max_len: usize,
    vocab_size: usize,
    probs: &Tensor,
    lengths: &[usize],
) -> Result<Tensor, AgonError> {
    let map_err = |e: candle_core::Error| AgonError::internal("align", e);
    let (l, b, v) = probs.dims3().map_err(map_err)?;
    for (what, expected, actual) in [
        ("aligned length", max_len, l),
        ("aligned batch", batch_size, b),
        ("aligned vocabulary", vocab_size, v),
        ("hypothesis lengths", batch_size, lengths.len()),
    ] {
        if expected != actual {
            return Err(AgonError::ShapeMismatch {
                what: what.to_string(),
                expected,
                actual,
            });
        }
    }

    let keep = length_mask(lengths, max_len, probs.device())?
        .unsqueeze(D::Minus1)
        .map_err(map_err)?;
    let fill = ((keep.ones_like().map_err(map_err)? - &keep).map_err(map_err)?
        / vocab_size as f64)
        .map_err(map_err)?;
    probs
        .broadcast_mul(&keep)
        .and_then(|kept| kept.broadcast_add(&fill))
        .map_err(map_err)
}
