//! Integration tests for the three-phase trainer.
//!
//! Uses the tiny reference model with a table-driven decoder so that the
//! hypotheses each phase sees are known in advance.

use std::collections::HashMap;

use agon_core::{AgonError, Batch, OneBestDecoder, BOS, EOS, PAD};
use agon_learn::config::{ProbeConfig, TrainConfig};
use agon_learn::distance::DistanceKind;
use agon_learn::optim::OptimConfig;
use agon_learn::sampler::{SamplingStrategy, SearchSampler};
use agon_learn::{ParameterStore, TrainOutcome, Trainer};
use agon_model::{RnnSearch, RnnSearchConfig};
use agon_translate::Bleu;
use candle_core::Device;

const VOCAB: usize = 24;

/// Returns a fixed output per source sentence, empty when unknown.
struct Table(HashMap<Vec<u32>, Vec<u32>>);

impl Table {
    fn new(entries: &[(&[u32], &[u32])]) -> Self {
        Self(entries.iter().map(|(s, t)| (s.to_vec(), t.to_vec())).collect())
    }
}

impl OneBestDecoder for Table {
    fn translate_one(&self, source: &[u32]) -> Result<Vec<u32>, AgonError> {
        Ok(self.0.get(source).cloned().unwrap_or_default())
    }
}

fn tiny_model() -> (ParameterStore, RnnSearch) {
    let store = ParameterStore::new();
    let model = RnnSearch::new(store.var_map(), &RnnSearchConfig::tiny(VOCAB, VOCAB), &Device::Cpu).unwrap();
    (store, model)
}

fn quick_config() -> TrainConfig {
    let optim = OptimConfig {
        learning_rate: 1e-3,
        ..OptimConfig::default()
    };
    TrainConfig {
        max_epochs: 1,
        probe: ProbeConfig {
            percentage: 1.0,
            bleu_threshold: 2.0,
            ..ProbeConfig::default()
        },
        discriminator: optim.clone(),
        supervised: optim.clone(),
        reinforcement: optim,
        ..TrainConfig::default()
    }
}

fn pairs() -> Vec<(Vec<u32>, Vec<u32>)> {
    vec![
        (vec![4, 6], vec![5, 7]),
        (vec![8], vec![9]),
        (vec![10, 11, 12], vec![13, 14, 15]),
        (vec![16, 17], vec![18, 19, 20, 21]),
        (vec![12, 4], vec![22, 5]),
        (vec![6], vec![7, 7]),
    ]
}

fn batches() -> Vec<Batch> {
    pairs()
        .chunks(2)
        .map(|c| Batch::from_pairs(c, &Device::Cpu).unwrap())
        .collect()
}

fn noisy_decoder() -> Table {
    Table::new(&[
        (&[4, 6], &[5, 7]),
        (&[8], &[9, 9]),
        (&[10, 11, 12], &[13, 15]),
        (&[16, 17], &[18, 19, 20, 22]),
        (&[12, 4], &[5]),
        (&[6], &[7]),
    ])
}

/// Two-example scenario: decoder output is normalized to BOS-led rows,
/// padded to the requested length, and the discriminator sees a strictly
/// positive divergence where the hypothesis prefix departs from gold.
#[test]
fn two_example_scenario() {
    let device = Device::Cpu;
    let batch = Batch::from_pairs(&[(vec![4, 6], vec![5, 7]), (vec![8], vec![9])], &device).unwrap();
    assert_eq!(
        batch.trg().to_vec2::<u32>().unwrap(),
        vec![vec![BOS, BOS], vec![5, 9], vec![7, EOS], vec![EOS, PAD]]
    );

    let decoder = Table::new(&[(&[4, 6], &[5, 7]), (&[8], &[9, 9])]);
    let hyps = SearchSampler::new(&decoder, 1).sample(&batch, 4).unwrap();
    assert_eq!(hyps.tokens().dims(), &[4, 2]);
    assert_eq!(
        hyps.tokens().to_vec2::<u32>().unwrap(),
        vec![vec![BOS, BOS], vec![5, 9], vec![7, 9], vec![PAD, PAD]]
    );
    assert_eq!(
        hyps.mask().to_vec2::<f32>().unwrap(),
        vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0, 1.0], vec![0.0, 0.0]]
    );
    assert_eq!(hyps.lengths(), &[3, 3]);

    let (store, model) = tiny_model();
    let scorer = Bleu::default();
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, quick_config()).unwrap();
    let d = trainer.discriminator_step(&batch).unwrap();
    assert!(d.loss > 0.0, "expected positive KL, got {}", d.loss);
    assert!(d.weighted > 0.0);
    assert!(d.grad_norm.is_finite());
}

/// Per batch: one discriminator update, four supervised updates, and one
/// reinforcement update except on the epoch's last batch.
#[test]
fn phase_counts_per_epoch() {
    let (store, model) = tiny_model();
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, quick_config()).unwrap();
    let report = trainer.train(&batches(), None).unwrap();

    assert_eq!(report.outcome, TrainOutcome::Completed);
    assert_eq!(report.epochs.len(), 1);
    let epoch = &report.epochs[0];
    assert_eq!(epoch.batches, 3);
    assert_eq!(epoch.discriminator_steps, 3);
    assert_eq!(epoch.supervised_steps, 12);
    assert_eq!(epoch.reinforce_steps, 2);
    assert_eq!(epoch.reinforce_skipped, 1);
    assert!(epoch.probe.is_some());
    assert!(epoch.word_nll.is_finite() && epoch.word_nll > 0.0);

    for opt in trainer.optimizers() {
        let expected = match opt.name() {
            "discriminator" => 3,
            "supervised" => 12,
            _ => 2,
        };
        assert_eq!(opt.steps(), expected, "{}", opt.name());
    }
}

/// A perfect decoder saturates the probe before any update.
#[test]
fn saturated_probe_stops_training() {
    let (store, model) = tiny_model();
    let long_pairs: Vec<(Vec<u32>, Vec<u32>)> = (0..4u32)
        .map(|i| (vec![4 + i, 5 + i], vec![8 + i, 9 + i, 10 + i, 11 + i, 12 + i]))
        .collect();
    let batches: Vec<Batch> = long_pairs
        .chunks(2)
        .map(|c| Batch::from_pairs(c, &Device::Cpu).unwrap())
        .collect();
    let oracle = Table(long_pairs.into_iter().collect());
    let scorer = Bleu::default();
    let config = TrainConfig {
        max_epochs: 3,
        probe: ProbeConfig {
            percentage: 1.0,
            ..ProbeConfig::default()
        },
        ..quick_config()
    };
    let mut trainer = Trainer::new(&model, store, &oracle, &scorer, config).unwrap();
    let before = trainer.store().named_tensors("").unwrap();
    let report = trainer.train(&batches, None).unwrap();

    match report.outcome {
        TrainOutcome::Saturated { epoch, bleu } => {
            assert_eq!(epoch, 1);
            assert!(bleu > 0.9);
        }
        other => panic!("expected saturation, got {other:?}"),
    }
    assert_eq!(report.epochs[0].batches, 0);
    for opt in trainer.optimizers() {
        assert_eq!(opt.steps(), 0);
    }
    for (name, t) in trainer.store().named_tensors("").unwrap() {
        assert_eq!(
            t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            before[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}

/// The Gumbel path samples from the gold-conditioned logits and still
/// runs every phase.
#[test]
fn gumbel_sampling_path_trains() {
    let (store, model) = tiny_model();
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let mut config = quick_config();
    config.sampling.strategy = SamplingStrategy::Gumbel;
    config.sampling.gumbel_temperature = 0.5;
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, config).unwrap();
    let report = trainer.train_batch(&batches()[0], 1, 0, 3, false).unwrap();
    assert_eq!(report.discriminator.len(), 1);
    assert_eq!(report.supervised.len(), 4);
    assert_eq!(report.reinforcement.len(), 1);
    assert!(report.discriminator[0].loss.is_finite());
    assert!(report.reinforcement[0].loss.is_finite());
}

/// Jensen-Shannon and gold-token KL run a full epoch as well as the default.
#[test]
fn every_distance_kind_completes_an_epoch() {
    for kind in [DistanceKind::Js, DistanceKind::KlSent] {
        let (store, model) = tiny_model();
        let decoder = noisy_decoder();
        let scorer = Bleu::default();
        let config = TrainConfig {
            distance: kind,
            ..quick_config()
        };
        let mut trainer = Trainer::new(&model, store, &decoder, &scorer, config).unwrap();
        let step = trainer.train_batch(&batches()[0], 1, 0, 3, false).unwrap();
        assert!(step.discriminator[0].loss.is_finite(), "{kind:?}");

        let report = trainer.train(&batches(), None).unwrap();
        assert_eq!(report.outcome, TrainOutcome::Completed, "{kind:?}");
        let epoch = &report.epochs[0];
        assert_eq!(epoch.discriminator_steps, 3, "{kind:?}");
        assert_eq!(epoch.reinforce_steps, 2, "{kind:?}");
        assert!(epoch.mean_weighted_distance.is_finite(), "{kind:?}");
        assert!(epoch.word_nll.is_finite(), "{kind:?}");
    }
}

/// Validation feeds the learning-rate schedule and writes a checkpoint
/// that a fresh trainer can restore.
#[test]
fn validation_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("agon");
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let mut config = quick_config();
    config.checkpoint.prefix = prefix.clone();
    let all = batches();

    let (store, model) = tiny_model();
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, config.clone()).unwrap();
    let report = trainer.train(&all[..2], Some(&all[2..])).unwrap();
    let valid_bleu = report.epochs[0].valid_bleu.unwrap();
    assert!((0.0..=1.0).contains(&valid_bleu));
    assert!(prefix.with_extension("json").exists());

    let (fresh_store, fresh_model) = tiny_model();
    let mut fresh = Trainer::new(&fresh_model, fresh_store, &decoder, &scorer, config).unwrap();
    let record = fresh.restore(&prefix, &Device::Cpu).unwrap();
    assert_eq!(record.epoch, 1);
    assert_eq!(record.valid_bleu, Some(valid_bleu));
    for opt in fresh.optimizers() {
        assert_eq!(opt.steps(), record.optimizers[opt.name()].steps);
    }
    let trained = trainer.store().named_tensors("").unwrap();
    for (name, t) in fresh.store().named_tensors("").unwrap() {
        assert_eq!(
            t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            trained[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}

/// A restored trainer continues with the epoch after the saved one.
#[test]
fn restored_trainer_resumes_after_saved_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("agon");
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let mut config = quick_config();
    config.checkpoint.prefix = prefix.clone();
    let all = batches();

    let (store, model) = tiny_model();
    let mut first = Trainer::new(&model, store, &decoder, &scorer, config.clone()).unwrap();
    first.train(&all[..2], Some(&all[2..])).unwrap();
    assert_eq!(first.next_epoch(), 2);

    let (fresh_store, fresh_model) = tiny_model();
    let resumed_config = TrainConfig {
        max_epochs: 2,
        ..config
    };
    let mut resumed = Trainer::new(&fresh_model, fresh_store, &decoder, &scorer, resumed_config).unwrap();
    assert_eq!(resumed.next_epoch(), 1);
    let record = resumed.restore(&prefix, &Device::Cpu).unwrap();
    assert_eq!(record.epoch, 1);
    assert_eq!(resumed.next_epoch(), 2);

    let report = resumed.train(&all[..2], None).unwrap();
    let epochs: Vec<usize> = report.epochs.iter().map(|e| e.epoch).collect();
    assert_eq!(epochs, vec![2]);
    assert_eq!(resumed.next_epoch(), 3);
}

/// Supervised updates lower the training loss on a repeated batch.
#[test]
fn supervised_updates_reduce_nll() {
    let (store, model) = tiny_model();
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let config = TrainConfig {
        supervised: OptimConfig {
            learning_rate: 1e-2,
            ..OptimConfig::default()
        },
        ..quick_config()
    };
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, config).unwrap();
    let batch = &batches()[1];
    let first = trainer.supervised_step(batch).unwrap();
    let mut last = first;
    for _ in 0..20 {
        last = trainer.supervised_step(batch).unwrap();
    }
    assert!(last.nll < first.nll, "{} !< {}", last.nll, first.nll);
    assert_eq!(last.tokens, 4 + 5);
}

#[test]
fn empty_training_set_is_rejected() {
    let (store, model) = tiny_model();
    let decoder = noisy_decoder();
    let scorer = Bleu::default();
    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, quick_config()).unwrap();
    assert!(matches!(trainer.train(&[], None), Err(AgonError::Data { .. })));
}
