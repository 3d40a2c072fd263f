//! Masked GRU cell.

use candle_core::{Result, Tensor};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::VarBuilder;

/// Single GRU step over `candle_nn`'s cell; padded examples keep their
/// previous state.
pub(crate) struct GruCell {
    cell: GRU,
}

impl GruCell {
    pub(crate) fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            cell: gru(in_dim, hidden_dim, GRUConfig::default(), vb)?,
        })
    }

    /// `x` is `(B, in)`, `h` is `(B, H)`, `mask` is `(B,)` f32.
    pub(crate) fn step(&self, x: &Tensor, h: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h_new = self.cell.step(x, &GRUState { h: h.clone() })?.h;
        match mask {
            Some(m) => {
                let m = m.unsqueeze(1)?;
                let keep = m.ones_like()?.sub(&m)?;
                h_new.broadcast_mul(&m)?.add(&h.broadcast_mul(&keep)?)
            }
            None => Ok(h_new),
        }
    }
}
