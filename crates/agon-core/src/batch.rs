//! Time-major training batch.
//!
//! A [`Batch`] holds `B` sentence pairs laid out as `(L, B)` token matrices
//! with PAD filling the tail of shorter sentences. Targets are wrapped as
//! `BOS w1 .. wn EOS`; sources carry only content tokens. Host-side copies
//! of every row are kept alongside the tensors so that decoding and BLEU
//! scoring never round-trip through the device.

use candle_core::{Device, Tensor};

use crate::error::AgonError;
use crate::tokens::{BOS, EOS, PAD};

/// An immutable batch of source/target pairs.
///
/// # Example
///
/// ```
/// use agon_core::Batch;
/// use candle_core::Device;
///
/// let pairs = vec![(vec![10, 11, 12], vec![5, 7]), (vec![13], vec![9])];
/// let batch = Batch::from_pairs(&pairs, &Device::Cpu).unwrap();
/// assert_eq!(batch.batch_size(), 2);
/// assert_eq!(batch.src_len(), 3);
/// // BOS 5 7 EOS
/// assert_eq!(batch.trg_len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Batch {
    src: Tensor,
    trg: Tensor,
    src_mask: Tensor,
    trg_mask: Tensor,
    src_lens: Vec<usize>,
    src_rows: Vec<Vec<u32>>,
    trg_rows: Vec<Vec<u32>>,
}

impl Batch {
    /// Builds a batch from `(source, target)` content-token pairs.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Data`] if `pairs` is empty or a source sentence
    /// is empty, and [`AgonError::Internal`] if tensor creation fails.
    pub fn from_pairs(pairs: &[(Vec<u32>, Vec<u32>)], device: &Device) -> Result<Self, AgonError> {
        if pairs.is_empty() {
            return Err(AgonError::Data {
                message: "Batch::from_pairs: no sentence pairs".to_string(),
            });
        }
        if let Some(i) = pairs.iter().position(|(src, _)| src.is_empty()) {
            return Err(AgonError::Data {
                message: format!("Batch::from_pairs: source sentence {i} is empty"),
            });
        }

        let src_rows: Vec<Vec<u32>> = pairs.iter().map(|(s, _)| s.clone()).collect();
        let trg_rows: Vec<Vec<u32>> = pairs
            .iter()
            .map(|(_, t)| {
                let mut row = Vec::with_capacity(t.len() + 2);
                row.push(BOS);
                row.extend_from_slice(t);
                row.push(EOS);
                row
            })
            .collect();
        let src_lens = src_rows.iter().map(Vec::len).collect();

        let (src, src_mask) = time_major(&src_rows, device)?;
        let (trg, trg_mask) = time_major(&trg_rows, device)?;

        Ok(Self {
            src,
            trg,
            src_mask,
            trg_mask,
            src_lens,
            src_rows,
            trg_rows,
        })
    }

    /// Number of sentence pairs.
    pub fn batch_size(&self) -> usize {
        self.src_rows.len()
    }

    /// Padded source length `Ls`.
    pub fn src_len(&self) -> usize {
        self.src_lens.iter().copied().max().unwrap_or(0)
    }

    /// Padded target length `Lt`, counting BOS and EOS.
    pub fn trg_len(&self) -> usize {
        self.trg_rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Source ids, `(Ls, B)` u32.
    pub fn src(&self) -> &Tensor {
        &self.src
    }

    /// Target ids, `(Lt, B)` u32.
    pub fn trg(&self) -> &Tensor {
        &self.trg
    }

    /// Source validity mask, `(Ls, B)` f32.
    pub fn src_mask(&self) -> &Tensor {
        &self.src_mask
    }

    /// Target validity mask, `(Lt, B)` f32.
    pub fn trg_mask(&self) -> &Tensor {
        &self.trg_mask
    }

    /// Per-example source lengths.
    pub fn src_lens(&self) -> &[usize] {
        &self.src_lens
    }

    /// Device the batch tensors live on.
    pub fn device(&self) -> &Device {
        self.src.device()
    }

    /// Gold decoder input: `trg[:-1]`.
    pub fn gold_feed(&self) -> Result<Tensor, AgonError> {
        self.trg
            .narrow(0, 0, self.trg_len() - 1)
            .map_err(|e| AgonError::internal("gold_feed", e))
    }

    /// Mask of [`Batch::gold_feed`].
    pub fn gold_feed_mask(&self) -> Result<Tensor, AgonError> {
        self.trg_mask
            .narrow(0, 0, self.trg_len() - 1)
            .map_err(|e| AgonError::internal("gold_feed_mask", e))
    }

    /// Prediction targets: `trg[1:]`.
    pub fn gold_output(&self) -> Result<Tensor, AgonError> {
        self.trg
            .narrow(0, 1, self.trg_len() - 1)
            .map_err(|e| AgonError::internal("gold_output", e))
    }

    /// Mask of [`Batch::gold_output`].
    pub fn gold_output_mask(&self) -> Result<Tensor, AgonError> {
        self.trg_mask
            .narrow(0, 1, self.trg_len() - 1)
            .map_err(|e| AgonError::internal("gold_output_mask", e))
    }

    /// Pad-free source tokens of example `b`.
    pub fn source_tokens(&self, b: usize) -> &[u32] {
        &self.src_rows[b]
    }

    /// Full target row of example `b`, `BOS .. EOS`.
    pub fn target_row(&self, b: usize) -> &[u32] {
        &self.trg_rows[b]
    }

    /// Target content of example `b` with BOS and EOS removed.
    pub fn reference_tokens(&self, b: usize) -> &[u32] {
        let row = &self.trg_rows[b];
        &row[1..row.len() - 1]
    }

    /// Total number of real target tokens the model predicts (`trg[1:]`).
    pub fn output_token_count(&self) -> usize {
        self.trg_rows.iter().map(|r| r.len() - 1).sum()
    }
}

/// Packs rows into a PAD-filled `(L, B)` id tensor and its f32 mask.
pub(crate) fn time_major(rows: &[Vec<u32>], device: &Device) -> Result<(Tensor, Tensor), AgonError> {
    let b = rows.len();
    let l = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = vec![PAD; l * b];
    let mut mask = vec![0.0f32; l * b];
    for (j, row) in rows.iter().enumerate() {
        for (t, &id) in row.iter().enumerate() {
            ids[t * b + j] = id;
            mask[t * b + j] = 1.0;
        }
    }
    let map_err = |e: candle_core::Error| AgonError::internal("time_major", e);
    let ids = Tensor::from_vec(ids, (l, b), device).map_err(map_err)?;
    let mask = Tensor::from_vec(mask, (l, b), device).map_err(map_err)?;
    Ok((ids, mask))
}
