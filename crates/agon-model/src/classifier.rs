//! Vocabulary projection head.

use agon_core::{AgonError, ProbabilityHead};
use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Linear map from decoder features to target-vocabulary scores.
pub struct Classifier {
    map_vocab: Linear,
    vocab_size: usize,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Classifier(→{})", self.vocab_size)
    }
}

impl Classifier {
    /// Creates the head under the `vb` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] if parameter creation fails.
    pub fn new(input_size: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self, AgonError> {
        let map_vocab = linear(input_size, vocab_size, vb.pp("map_vocab"))
            .map_err(|e| AgonError::internal("Classifier::new", e))?;
        Ok(Self {
            map_vocab,
            vocab_size,
        })
    }
}

impl ProbabilityHead for Classifier {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn logits(&self, features: &Tensor) -> Result<Tensor, AgonError> {
        self.map_vocab
            .forward(features)
            .map_err(|e| AgonError::internal("Classifier::logits", e))
    }

    fn to_probabilities(
        &self,
        features: &Tensor,
        noise: Option<&Tensor>,
        temperature: Option<f64>,
    ) -> Result<Tensor, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("Classifier::to_probabilities", e);
        let mut logits = self.logits(features)?;
        if let Some(g) = noise {
            logits = (logits + g).map_err(map_err)?;
        }
        if let Some(tau) = temperature {
            logits = (logits / tau).map_err(map_err)?;
        }
        candle_nn::ops::softmax(&logits, D::Minus1).map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn head() -> (Classifier, Device) {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        (Classifier::new(4, 6, vb.pp("classifier")).unwrap(), device)
    }

    #[test]
    fn probabilities_sum_to_one() {
        let (head, device) = head();
        let features = Tensor::randn(0f32, 1.0, (3, 2, 4), &device).unwrap();
        let probs = head.to_probabilities(&features, None, None).unwrap();
        assert_eq!(probs.dims(), &[3, 2, 6]);
        let sums = probs.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert_relative_eq!(s, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn low_temperature_sharpens() {
        let (head, device) = head();
        let features = Tensor::randn(0f32, 1.0, (1, 1, 4), &device).unwrap();
        let noise = Tensor::zeros((1, 1, 6), DType::F32, &device).unwrap();
        let soft = head.to_probabilities(&features, Some(&noise), Some(1.0)).unwrap();
        let sharp = head.to_probabilities(&features, Some(&noise), Some(0.05)).unwrap();
        let max = |t: &Tensor| t.flatten_all().unwrap().max(0).unwrap().to_vec0::<f32>().unwrap();
        assert!(max(&sharp) >= max(&soft));
    }
}
