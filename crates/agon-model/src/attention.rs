//! Additive attention over encoder annotations.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

pub(crate) struct Attention {
    state_proj: Linear,
    score: Linear,
}

impl Attention {
    pub(crate) fn new(dec_hidden: usize, align: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            state_proj: linear(dec_hidden, align, vb.pp("sa"))?,
            score: linear(align, 1, vb.pp("a1"))?,
        })
    }

    /// Returns `(alpha (Ls, B), context (B, 2He))`.
    ///
    /// `uh` is the precomputed projection of the annotations `(Ls, B, A)`.
    pub(crate) fn forward(
        &self,
        state: &Tensor,
        annotations: &Tensor,
        uh: &Tensor,
        src_mask: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let proj = self.state_proj.forward(state)?.unsqueeze(0)?;
        let energy = self
            .score
            .forward(&uh.broadcast_add(&proj)?.tanh()?)?
            .squeeze(D::Minus1)?;
        // masked softmax over source positions
        let max = energy.max_keepdim(0)?.detach();
        let weights = (energy.broadcast_sub(&max)?.exp()? * src_mask)?;
        let norm = (weights.sum_keepdim(0)? + 1e-12)?;
        let alpha = weights.broadcast_div(&norm)?;
        let context = annotations.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)?.sum(0)?;
        Ok((alpha, context))
    }
}
