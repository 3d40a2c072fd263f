//! Memory-bounded cross-entropy backward.
//!
//! The vocabulary projection is the widest activation in the network. To
//! keep its footprint bounded, the decoder features are cut from the graph,
//! the classifier loss is run and backpropagated one time shard at a time,
//! and the accumulated feature gradient is then pushed through the decoder
//! with a single surrogate backward `sum(features * grad)`.

use std::collections::HashMap;

use agon_core::{AgonError, ProbabilityHead, PAD};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, TensorId, Var, D};
use serde::{Deserialize, Serialize};

/// How the summed token loss is scaled before backward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Divide by the number of sentences in the batch.
    #[default]
    Sentences,
    /// Divide by the number of real target tokens.
    Tokens,
}

/// Per-tensor gradient accumulator that outlives individual backward passes.
#[derive(Debug, Default)]
pub struct GradientBuffer {
    grads: HashMap<TensorId, Tensor>,
}

impl GradientBuffer {
    /// Adds the gradients `store` holds for `tracked` into the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] if a sum fails.
    pub fn absorb<'t>(
        &mut self,
        store: &GradStore,
        tracked: impl IntoIterator<Item = &'t Tensor>,
    ) -> Result<(), AgonError> {
        for t in tracked {
            if let Some(g) = store.get(t) {
                let sum = match self.grads.remove(&t.id()) {
                    Some(prev) => (prev + g).map_err(|e| AgonError::internal("GradientBuffer::absorb", e))?,
                    None => g.clone(),
                };
                self.grads.insert(t.id(), sum);
            }
        }
        Ok(())
    }

    /// Removes and returns the accumulated gradient of `t`.
    pub fn take(&mut self, t: &Tensor) -> Option<Tensor> {
        self.grads.remove(&t.id())
    }

    /// Adds every buffered gradient of `vars` into `store`, draining them.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] if a sum fails.
    pub fn merge_into(&mut self, store: &mut GradStore, vars: &[Var]) -> Result<(), AgonError> {
        for var in vars {
            let t = var.as_tensor();
            if let Some(g) = self.take(t) {
                let merged = match store.remove(t) {
                    Some(prev) => (prev + g).map_err(|e| AgonError::internal("GradientBuffer::merge_into", e))?,
                    None => g,
                };
                store.insert(t, merged);
            }
        }
        Ok(())
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Output of [`sharded_cross_entropy`].
pub struct ShardedLoss {
    /// Gradients for every parameter that influenced the loss.
    pub grads: GradStore,
    /// Summed negative log-likelihood over real tokens (unscaled).
    pub nll: f32,
    /// Number of real target tokens.
    pub tokens: usize,
    /// Tokens whose argmax prediction equals the gold token.
    pub correct: usize,
}

impl std::fmt::Debug for ShardedLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLoss")
            .field("nll", &self.nll)
            .field("tokens", &self.tokens)
            .field("correct", &self.correct)
            .finish()
    }
}

/// Options for [`sharded_cross_entropy`].
#[derive(Debug, Clone, Copy)]
pub struct ShardOptions {
    /// Time steps per shard (default: 100).
    pub shard_size: usize,
    /// Loss scaling (default: sentences).
    pub normalization: Normalization,
    /// Probability mass spread over non-gold, non-PAD tokens (default: 0.0).
    pub label_smoothing: f64,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            shard_size: 100,
            normalization: Normalization::Sentences,
            label_smoothing: 0.0,
        }
    }
}

/// Cross-entropy of `head(features)` against `gold`, backpropagated shard
/// by shard.
///
/// `features` `(L, B, H)` must still be attached to the network's graph;
/// `gold` is `(L, B)` u32 and `gold_mask` `(L, B)` f32. `params` lists every
/// trainable variable, so classifier gradients can be collected across
/// shards.
///
/// # Errors
///
/// Returns [`AgonError::InvalidConfig`] for a zero shard size and
/// [`AgonError::Internal`] on tensor failures.
pub fn sharded_cross_entropy<H: ProbabilityHead + ?Sized>(
    features: &Tensor,
    gold: &Tensor,
    gold_mask: &Tensor,
    head: &H,
    params: &[Var],
    options: &ShardOptions,
) -> Result<ShardedLoss, AgonError> {
    if options.shard_size == 0 {
        return Err(AgonError::InvalidConfig {
            message: "shard_size must be positive".to_string(),
        });
    }
    let map_err = |e: candle_core::Error| AgonError::internal("sharded_cross_entropy", e);
    let (len, batch) = gold.dims2().map_err(map_err)?;
    let tokens = gold_mask
        .sum_all()
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(map_err)?
        .round() as usize;
    let norm = match options.normalization {
        Normalization::Sentences => batch.max(1) as f64,
        Normalization::Tokens => tokens.max(1) as f64,
    };

    let detached = Var::from_tensor(&features.detach()).map_err(map_err)?;
    let mut buffer = GradientBuffer::default();
    let mut nll_total = 0.0f64;
    let mut correct = 0usize;

    let mut start = 0;
    while start < len {
        let n = options.shard_size.min(len - start);
        let feed = detached.as_tensor().narrow(0, start, n).map_err(map_err)?;
        let g = gold.narrow(0, start, n).map_err(map_err)?;
        let m = gold_mask.narrow(0, start, n).map_err(map_err)?;

        let logits = head.logits(&feed)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1).map_err(map_err)?;
        let picked = g
            .unsqueeze(D::Minus1)
            .and_then(|idx| log_probs.gather(&idx, 2))
            .and_then(|p| p.squeeze(2))
            .map_err(map_err)?;
        let nll = (&picked * &m)
            .and_then(|x| x.sum_all())
            .and_then(|x| x.neg())
            .map_err(map_err)?;

        let loss = if options.label_smoothing > 0.0 {
            smoothed_loss(&log_probs, &picked, &m, options.label_smoothing).map_err(map_err)?
        } else {
            nll.clone()
        };
        let shard_grads = (loss / norm).and_then(|l| l.backward()).map_err(map_err)?;
        buffer.absorb(
            &shard_grads,
            params
                .iter()
                .map(Var::as_tensor)
                .chain(std::iter::once(detached.as_tensor())),
        )?;

        nll_total += nll.to_vec0::<f32>().map_err(map_err)? as f64;
        correct += logits
            .argmax(D::Minus1)
            .and_then(|pred| pred.eq(&g))
            .and_then(|hit| hit.to_dtype(DType::F32))
            .and_then(|hit| hit * &m)
            .and_then(|hit| hit.sum_all())
            .and_then(|hit| hit.to_vec0::<f32>())
            .map_err(map_err)?
            .round() as usize;
        start += n;
    }

    let feature_grad = match buffer.take(detached.as_tensor()) {
        Some(g) => g,
        None => features.zeros_like().map_err(map_err)?,
    };
    let mut grads = (features * &feature_grad)
        .and_then(|s| s.sum_all())
        .and_then(|s| s.backward())
        .map_err(map_err)?;
    buffer.merge_into(&mut grads, params)?;

    Ok(ShardedLoss {
        grads,
        nll: nll_total as f32,
        tokens,
        correct,
    })
}

/// Cross-entropy against a target with `1 - smoothing` on the gold token
/// and `smoothing / (V - 2)` on every other non-PAD token.
fn smoothed_loss(
    log_probs: &Tensor,
    picked: &Tensor,
    mask: &Tensor,
    smoothing: f64,
) -> candle_core::Result<Tensor> {
    let vocab = log_probs.dim(D::Minus1)?;
    let spread = smoothing / (vocab.saturating_sub(2).max(1)) as f64;
    let pad = log_probs.narrow(D::Minus1, PAD as usize, 1)?.squeeze(D::Minus1)?;
    let others = ((log_probs.sum(D::Minus1)? - pad)? - picked)?;
    let per_token = ((picked * (1.0 - smoothing))? + (others * spread)?)?;
    (per_token * mask)?.sum_all()?.neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agon_core::{Batch, TranslationModel};
    use agon_model::{RnnSearch, RnnSearchConfig};
    use approx::assert_relative_eq;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn setup() -> (VarMap, RnnSearch, Batch) {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(20, 20), &device).unwrap();
        let batch = Batch::from_pairs(
            &[(vec![4, 5, 6], vec![7, 8, 9, 10]), (vec![11], vec![12])],
            &device,
        )
        .unwrap();
        (var_map, model, batch)
    }

    fn run(var_map: &VarMap, model: &RnnSearch, batch: &Batch, options: &ShardOptions) -> ShardedLoss {
        let features = model
            .forward(batch.src(), &batch.gold_feed().unwrap(), batch.src_mask(), &batch.gold_feed_mask().unwrap())
            .unwrap();
        sharded_cross_entropy(
            &features,
            &batch.gold_output().unwrap(),
            &batch.gold_output_mask().unwrap(),
            model.classifier(),
            &var_map.all_vars(),
            options,
        )
        .unwrap()
    }

    #[test]
    fn shard_size_does_not_change_gradients() {
        let (var_map, model, batch) = setup();
        let whole = run(&var_map, &model, &batch, &ShardOptions::default());
        let split = run(
            &var_map,
            &model,
            &batch,
            &ShardOptions {
                shard_size: 2,
                ..ShardOptions::default()
            },
        );
        assert_relative_eq!(whole.nll, split.nll, epsilon = 1e-4);
        assert_eq!(whole.tokens, 5 + 2);
        for var in var_map.all_vars() {
            let a = whole.grads.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = split.grads.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for (x, y) in a.iter().zip(&b) {
                assert_relative_eq!(x, y, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn matches_direct_backward() {
        let (var_map, model, batch) = setup();
        let sharded = run(&var_map, &model, &batch, &ShardOptions { shard_size: 1, ..ShardOptions::default() });

        let features = model
            .forward(batch.src(), &batch.gold_feed().unwrap(), batch.src_mask(), &batch.gold_feed_mask().unwrap())
            .unwrap();
        let logits = model.classifier().logits(&features).unwrap();
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1).unwrap();
        let gold = batch.gold_output().unwrap().unsqueeze(2).unwrap();
        let picked = log_probs.gather(&gold, 2).unwrap().squeeze(2).unwrap();
        let nll = (picked * batch.gold_output_mask().unwrap()).unwrap().sum_all().unwrap().neg().unwrap();
        let direct = (nll / 2.0).unwrap().backward().unwrap();

        for var in var_map.all_vars() {
            let a = sharded.grads.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = direct.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for (x, y) in a.iter().zip(&b) {
                assert_relative_eq!(x, y, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn label_smoothing_changes_loss_not_nll() {
        let (var_map, model, batch) = setup();
        let plain = run(&var_map, &model, &batch, &ShardOptions::default());
        let smooth = run(
            &var_map,
            &model,
            &batch,
            &ShardOptions {
                label_smoothing: 0.1,
                ..ShardOptions::default()
            },
        );
        assert_relative_eq!(plain.nll, smooth.nll, epsilon = 1e-5);
        assert!(smooth.correct <= smooth.tokens);
    }

    #[test]
    fn zero_shard_size_is_rejected() {
        let (var_map, model, batch) = setup();
        let features = model
            .forward(batch.src(), &batch.gold_feed().unwrap(), batch.src_mask(), &batch.gold_feed_mask().unwrap())
            .unwrap();
        let err = sharded_cross_entropy(
            &features,
            &batch.gold_output().unwrap(),
            &batch.gold_output_mask().unwrap(),
            model.classifier(),
            &var_map.all_vars(),
            &ShardOptions {
                shard_size: 0,
                ..ShardOptions::default()
            },
        );
        assert!(matches!(err, Err(AgonError::InvalidConfig { .. })));
    }
}
