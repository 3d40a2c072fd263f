//! Padded batch of sampled hypotheses.
//!
//! Both sampling strategies produce a [`HypothesisSet`]. The search path
//! hands over host-side token columns, the stochastic path a device tensor
//! plus lengths; each goes through its own constructor and the resulting
//! value is indistinguishable downstream.
//!
//! Every set upholds three rules:
//! - row 0 of every column is BOS,
//! - `1 <= length <= max_len` for every example,
//! - the mask is 1.0 for `t < length` and 0.0 afterwards.

use candle_core::{Device, Tensor};

use crate::error::AgonError;
use crate::tokens::{BOS, PAD};

/// Hypothesis tokens `(max_len, B)`, validity mask and per-example lengths.
///
/// # Example
///
/// ```
/// use agon_core::{HypothesisSet, tokens::BOS};
/// use candle_core::Device;
///
/// let hyps = HypothesisSet::from_columns(
///     vec![vec![BOS, 5, 7], vec![BOS, 9]],
///     4,
///     &Device::Cpu,
/// ).unwrap();
/// assert_eq!(hyps.lengths(), &[3, 2]);
/// assert_eq!(hyps.max_len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct HypothesisSet {
    tokens: Tensor,
    mask: Tensor,
    lengths: Vec<usize>,
    rows: Vec<Vec<u32>>,
    max_len: usize,
}

impl HypothesisSet {
    /// Builds a set from host-side columns, truncating each to `max_len`
    /// and right-padding with PAD.
    ///
    /// Columns must already start with BOS and contain no PAD.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Data`] if `max_len` is zero, a column is empty,
    /// does not start with BOS, or contains PAD.
    pub fn from_columns(
        columns: Vec<Vec<u32>>,
        max_len: usize,
        device: &Device,
    ) -> Result<Self, AgonError> {
        if max_len == 0 {
            return Err(AgonError::Data {
                message: "HypothesisSet::from_columns: max_len must be positive".to_string(),
            });
        }
        let b = columns.len();
        let mut ids = vec![PAD; max_len * b];
        let mut lengths = Vec::with_capacity(b);
        let mut rows = Vec::with_capacity(b);
        for (j, mut col) in columns.into_iter().enumerate() {
            if col.first() != Some(&BOS) {
                return Err(AgonError::Data {
                    message: format!("HypothesisSet::from_columns: column {j} does not start with BOS"),
                });
            }
            if col.contains(&PAD) {
                return Err(AgonError::Data {
                    message: format!("HypothesisSet::from_columns: column {j} contains PAD"),
                });
            }
            col.truncate(max_len);
            for (t, &id) in col.iter().enumerate() {
                ids[t * b + j] = id;
            }
            lengths.push(col.len());
            rows.push(col);
        }

        let tokens = Tensor::from_vec(ids, (max_len, b), device)
            .map_err(|e| AgonError::internal("HypothesisSet::from_columns", e))?;
        let mask = length_mask(&lengths, max_len, device)?;
        Ok(Self {
            tokens,
            mask,
            lengths,
            rows,
            max_len,
        })
    }

    /// Wraps a `(max_len, B)` u32 token tensor whose valid prefix lengths
    /// are already known.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::ShapeMismatch`] if `lengths` does not match the
    /// batch dimension, and [`AgonError::Data`] if a length is zero, exceeds
    /// `max_len`, or a column does not start with BOS.
    pub fn from_tensor(tokens: Tensor, lengths: Vec<usize>) -> Result<Self, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("HypothesisSet::from_tensor", e);
        let (max_len, b) = tokens.dims2().map_err(map_err)?;
        if lengths.len() != b {
            return Err(AgonError::ShapeMismatch {
                what: "hypothesis lengths".to_string(),
                expected: b,
                actual: lengths.len(),
            });
        }
        let grid = tokens.to_vec2::<u32>().map_err(map_err)?;
        let mut rows = Vec::with_capacity(b);
        for (j, &len) in lengths.iter().enumerate() {
            if len == 0 || len > max_len {
                return Err(AgonError::Data {
                    message: format!("HypothesisSet::from_tensor: length {len} of column {j} outside 1..={max_len}"),
                });
            }
            if grid[0][j] != BOS {
                return Err(AgonError::Data {
                    message: format!("HypothesisSet::from_tensor: column {j} does not start with BOS"),
                });
            }
            rows.push((0..len).map(|t| grid[t][j]).collect());
        }
        let mask = length_mask(&lengths, max_len, tokens.device())?;
        Ok(Self {
            tokens,
            mask,
            lengths,
            rows,
            max_len,
        })
    }

    /// Token ids, `(max_len, B)` u32.
    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Validity mask, `(max_len, B)` f32.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Valid prefix length per example, BOS included.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Padded time length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Number of hypotheses.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Valid tokens of example `b`, BOS included.
    pub fn row(&self, b: usize) -> &[u32] {
        &self.rows[b]
    }

    /// Valid tokens of example `b` without the leading BOS.
    pub fn content(&self, b: usize) -> &[u32] {
        &self.rows[b][1..]
    }
}

/// `(max_len, B)` f32 mask with 1.0 where `t < lengths[b]`.
pub fn length_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor, AgonError> {
    let b = lengths.len();
    let mut data = vec![0.0f32; max_len * b];
    for (j, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(max_len) {
            data[t * b + j] = 1.0;
        }
    }
    Tensor::from_vec(data, (max_len, b), device).map_err(|e| AgonError::internal("length_mask", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::EOS;
    use proptest::prelude::*;

    #[test]
    fn columns_are_truncated_and_padded() {
        let hyps = HypothesisSet::from_columns(
            vec![vec![BOS, 4, 5, 6, 7, 8], vec![BOS]],
            3,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(hyps.lengths(), &[3, 1]);
        let tokens = hyps.tokens().to_vec2::<u32>().unwrap();
        assert_eq!(tokens, vec![vec![BOS, BOS], vec![4, PAD], vec![5, PAD]]);
        let mask = hyps.mask().to_vec2::<f32>().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0]]);
        assert_eq!(hyps.content(0), &[4, 5]);
    }

    #[test]
    fn rejects_missing_bos() {
        let err = HypothesisSet::from_columns(vec![vec![4, 5]], 3, &Device::Cpu);
        assert!(matches!(err, Err(AgonError::Data { .. })));
        let err = HypothesisSet::from_columns(vec![vec![BOS, PAD, 5]], 3, &Device::Cpu);
        assert!(err.is_err());
    }

    #[test]
    fn from_tensor_builds_mask_from_lengths() {
        let tokens = Tensor::from_vec(vec![BOS, BOS, 9, EOS, EOS, 4], (3, 2), &Device::Cpu).unwrap();
        let hyps = HypothesisSet::from_tensor(tokens, vec![2, 1]).unwrap();
        assert_eq!(hyps.row(0), &[BOS, 9]);
        assert_eq!(hyps.row(1), &[BOS]);
        let mask = hyps.mask().to_vec2::<f32>().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0], vec![1.0, 0.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn from_tensor_checks_lengths() {
        let tokens = Tensor::from_vec(vec![BOS, BOS], (1, 2), &Device::Cpu).unwrap();
        assert!(matches!(
            HypothesisSet::from_tensor(tokens.clone(), vec![1]),
            Err(AgonError::ShapeMismatch { .. })
        ));
        assert!(HypothesisSet::from_tensor(tokens, vec![1, 2]).is_err());
    }

    proptest! {
        #[test]
        fn mask_is_monotone(cols in prop::collection::vec(prop::collection::vec(4u32..50, 0..12), 1..6), max_len in 1usize..10) {
            let columns: Vec<Vec<u32>> = cols
                .into_iter()
                .map(|c| std::iter::once(BOS).chain(c).collect())
                .collect();
            let hyps = HypothesisSet::from_columns(columns, max_len, &Device::Cpu).unwrap();
            let mask = hyps.mask().to_vec2::<f32>().unwrap();
            for (j, &len) in hyps.lengths().iter().enumerate() {
                prop_assert!(len >= 1 && len <= max_len);
                for (t, row) in mask.iter().enumerate() {
                    prop_assert_eq!(row[j], if t < len { 1.0 } else { 0.0 });
                }
            }
        }
    }
}
