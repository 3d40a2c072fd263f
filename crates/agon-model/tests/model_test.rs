//! Integration tests for the reference RNNsearch model.

use agon_core::{Batch, OneBestDecoder, ProbabilityHead, TranslationModel, EOS};
use agon_model::{GreedyDecoder, RnnSearch, RnnSearchConfig};
use approx::assert_relative_eq;
use candle_core::{Device, D};
use candle_nn::VarMap;

fn setup() -> (VarMap, RnnSearch, Batch) {
    let device = Device::Cpu;
    let var_map = VarMap::new();
    let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(16, 18), &device).unwrap();
    let batch = Batch::from_pairs(
        &[(vec![4, 5, 6], vec![7, 8]), (vec![9, 10], vec![11, 12, 13])],
        &device,
    )
    .unwrap();
    (var_map, model, batch)
}

/// Gold-prefix probabilities are a distribution over the target vocab.
#[test]
fn probabilities_sum_to_one() {
    let (_, model, batch) = setup();
    let features = model
        .forward(
            batch.src(),
            &batch.gold_feed().unwrap(),
            batch.src_mask(),
            &batch.gold_feed_mask().unwrap(),
        )
        .unwrap();
    let probs = model.classifier().to_probabilities(&features, None, None).unwrap();
    assert_eq!(probs.dims(), &[4, 2, 18]);
    let sums = probs.sum(D::Minus1).unwrap().to_vec2::<f32>().unwrap();
    for row in sums {
        for s in row {
            assert_relative_eq!(s, 1.0, epsilon = 1e-5);
        }
    }
}

/// Every variable receives a gradient from a gold-prefix loss.
#[test]
fn gradients_reach_every_parameter() {
    let (var_map, model, batch) = setup();
    let features = model
        .forward(
            batch.src(),
            &batch.gold_feed().unwrap(),
            batch.src_mask(),
            &batch.gold_feed_mask().unwrap(),
        )
        .unwrap();
    let logits = model.classifier().logits(&features).unwrap();
    let loss = logits.sqr().unwrap().sum_all().unwrap();
    let grads = loss.backward().unwrap();
    for var in var_map.all_vars() {
        assert!(grads.get(var.as_tensor()).is_some());
    }
}

/// Greedy decoding is deterministic and bounded.
#[test]
fn greedy_decoding_is_deterministic() {
    let (_, model, _) = setup();
    let decoder = GreedyDecoder::new(&model, 6);
    let a = decoder.translate_one(&[4, 5, 6]).unwrap();
    let b = decoder.translate_one(&[4, 5, 6]).unwrap();
    assert_eq!(a, b);
    assert!(!a.is_empty() && a.len() <= 6);
    if a.len() < 6 {
        assert_eq!(a.last(), Some(&EOS));
    }
}
