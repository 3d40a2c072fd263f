//! Greedy one-best decoding.

use agon_core::{AgonError, OneBestDecoder, ProbabilityHead, BOS, EOS};
use candle_core::{DType, Tensor, D};

use crate::rnnsearch::RnnSearch;

/// Argmax decoder over a shared [`RnnSearch`].
///
/// Always sees the current parameter values, since it borrows the same
/// network the trainer updates.
///
/// # Example
///
/// ```
/// use agon_core::OneBestDecoder;
/// use agon_model::{GreedyDecoder, RnnSearch, RnnSearchConfig};
/// use candle_core::Device;
/// use candle_nn::VarMap;
///
/// let var_map = VarMap::new();
/// let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(16, 16), &Device::Cpu).unwrap();
/// let decoder = GreedyDecoder::new(&model, 5);
/// let out = decoder.translate_one(&[4, 5, 6]).unwrap();
/// assert!(out.len() <= 5);
/// ```
#[derive(Debug)]
pub struct GreedyDecoder<'m> {
    model: &'m RnnSearch,
    max_len: usize,
}

impl<'m> GreedyDecoder<'m> {
    /// Decodes at most `max_len` tokens per sentence.
    pub fn new(model: &'m RnnSearch, max_len: usize) -> Self {
        Self { model, max_len }
    }

    /// Maximum output length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl OneBestDecoder for GreedyDecoder<'_> {
    /// Returns the predicted ids without BOS; the final id is EOS when the
    /// model stopped on its own.
    fn translate_one(&self, source: &[u32]) -> Result<Vec<u32>, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("GreedyDecoder::translate_one", e);
        if source.is_empty() {
            return Ok(Vec::new());
        }
        let device = self.model.device();
        let src = Tensor::from_slice(source, (source.len(), 1), device).map_err(map_err)?;
        let src_mask = Tensor::ones((source.len(), 1), DType::F32, device).map_err(map_err)?;
        let enc = self.model.encode(&src, &src_mask)?;

        let head = agon_core::TranslationModel::classifier(self.model);
        let mut state = enc.init_state.clone();
        let mut prev = BOS;
        let mut out = Vec::with_capacity(self.max_len);
        for _ in 0..self.max_len {
            let y = Tensor::new(&[prev], device).map_err(map_err)?;
            let (features, next) = self.model.decode_step(&enc, &y, &state, None)?;
            let best = head
                .logits(&features.detach())?
                .argmax(D::Minus1)
                .and_then(|t| t.to_vec1::<u32>())
                .map_err(map_err)?;
            prev = best.first().copied().unwrap_or(EOS);
            out.push(prev);
            if prev == EOS {
                break;
            }
            state = next.detach();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use crate::RnnSearchConfig;

    #[test]
    fn respects_max_len_and_stops_at_eos() {
        let var_map = VarMap::new();
        let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(16, 16), &Device::Cpu).unwrap();
        let decoder = GreedyDecoder::new(&model, 7);
        let out = decoder.translate_one(&[4, 5]).unwrap();
        assert!(!out.is_empty() && out.len() <= 7);
        if let Some(pos) = out.iter().position(|&t| t == EOS) {
            assert_eq!(pos, out.len() - 1);
        }
    }

    #[test]
    fn empty_source_decodes_to_nothing() {
        let var_map = VarMap::new();
        let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(16, 16), &Device::Cpu).unwrap();
        assert!(GreedyDecoder::new(&model, 7).translate_one(&[]).unwrap().is_empty());
    }
}
