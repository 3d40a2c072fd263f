//! The three-phase fine-tuning loop.
//!
//! Each epoch starts with a BLEU probe on a random slice of the training
//! batches; if the model already translates them nearly perfectly, training
//! stops as [`TrainOutcome::Saturated`]. Otherwise every batch runs:
//!
//! 1. discriminator updates: push the distribution the model predicts after
//!    its own hypotheses toward the one it predicts after the gold prefix
//! 2. supervised updates: sharded cross-entropy on the gold target
//! 3. a reinforcement update: align sentence confidence with BLEU through
//!    the pairwise correlation loss (skipped on the epoch's last batch)
//!
//! All three optimizers share one [`ParameterStore`]; every update runs on
//! the caller's thread, one after the other.

use std::collections::BTreeMap;
use std::path::Path;

use agon_core::rng::{seeded, TrainRng};
use agon_core::{
    AgonError, Batch, HypothesisSet, OneBestDecoder, ProbabilityHead, SentenceScorer, TranslationModel,
};
use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointPaths, CheckpointRecord};
use crate::config::TrainConfig;
use crate::correlation::{sentence_confidence, PairwiseCorrelation};
use crate::distance::distance;
use crate::optim::PhaseOptimizer;
use crate::padding::align;
use crate::params::ParameterStore;
use crate::probe::{bleu_probe, ProbeResult};
use crate::sampler::{gumbel_sample, SamplingStrategy, SearchSampler};
use crate::shard::sharded_cross_entropy;

const DISCRIMINATOR: &str = "discriminator";
const SUPERVISED: &str = "supervised";
const REINFORCEMENT: &str = "reinforcement";

/// How a training run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainOutcome {
    /// Every configured epoch ran.
    Completed,
    /// The start-of-epoch probe exceeded the BLEU threshold.
    Saturated {
        /// Epoch whose probe stopped training.
        epoch: usize,
        /// Probe BLEU.
        bleu: f32,
    },
}

/// Diagnostics of one discriminator update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscriminatorStats {
    /// Backpropagated divergence.
    pub loss: f32,
    /// Per-time-step weighted divergence.
    pub weighted: f32,
    /// Pre-clip gradient norm.
    pub grad_norm: f32,
}

/// Diagnostics of one supervised update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisedStats {
    /// Summed token NLL.
    pub nll: f32,
    /// Real target tokens.
    pub tokens: usize,
    /// Tokens predicted correctly by argmax.
    pub correct: usize,
    /// Sentences in the batch.
    pub sentences: usize,
    /// Pre-clip gradient norm.
    pub grad_norm: f32,
}

impl SupervisedStats {
    /// NLL per token (W-MLE).
    pub fn word_nll(&self) -> f32 {
        self.nll / self.tokens.max(1) as f32
    }

    /// Per-token perplexity (W-ppl).
    pub fn word_perplexity(&self) -> f32 {
        self.word_nll().exp()
    }

    /// NLL per sentence (S-MLE).
    pub fn sentence_nll(&self) -> f32 {
        self.nll / self.sentences.max(1) as f32
    }
}

/// Diagnostics of one reinforcement update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReinforceStats {
    /// Pairwise correlation loss.
    pub loss: f32,
    /// Correlation between confidence and reward.
    pub rho: f32,
    /// Mean sentence BLEU of the hypotheses.
    pub mean_bleu: f32,
    /// Corpus BLEU of the batch's hypotheses.
    pub batch_bleu: f32,
    /// Pre-clip gradient norm.
    pub grad_norm: f32,
}

/// Everything that happened to one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// One entry per discriminator update.
    pub discriminator: Vec<DiscriminatorStats>,
    /// One entry per supervised update.
    pub supervised: Vec<SupervisedStats>,
    /// One entry per reinforcement update; empty when skipped.
    pub reinforcement: Vec<ReinforceStats>,
}

/// Per-epoch counters and averages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochReport {
    /// Epoch number.
    pub epoch: usize,
    /// Start-of-epoch probe, if any batches were probed.
    pub probe: Option<ProbeResult>,
    /// Batches trained.
    pub batches: usize,
    /// Discriminator updates taken.
    pub discriminator_steps: usize,
    /// Supervised updates taken.
    pub supervised_steps: usize,
    /// Reinforcement updates taken.
    pub reinforce_steps: usize,
    /// Batches whose reinforcement phase was skipped.
    pub reinforce_skipped: usize,
    /// Mean weighted discriminator divergence.
    pub mean_weighted_distance: f32,
    /// Summed NLL over all supervised updates divided by their tokens.
    pub word_nll: f32,
    /// Mean sentence BLEU seen by the reinforcement phase.
    pub mean_reinforce_bleu: f32,
    /// Validation corpus BLEU at epoch end.
    pub valid_bleu: Option<f32>,
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    /// How training ended.
    pub outcome: TrainOutcome,
    /// One report per epoch that started (the saturated epoch included).
    pub epochs: Vec<EpochReport>,
}

/// Drives the adversarial, supervised and reinforcement phases over a
/// shared parameter store.
///
/// `M` is the trainable network whose variables live in the store; `D`
/// produces the one-best hypotheses for search sampling and validation;
/// `S` scores them.
pub struct Trainer<'a, M, D, S>
where
    M: TranslationModel,
    D: OneBestDecoder + ?Sized,
    S: SentenceScorer + ?Sized,
{
    model: &'a M,
    decoder: &'a D,
    scorer: &'a S,
    store: ParameterStore,
    config: TrainConfig,
    discriminator: PhaseOptimizer,
    supervised: PhaseOptimizer,
    reinforcement: PhaseOptimizer,
    correlation: PairwiseCorrelation,
    rng: TrainRng,
    best_valid_bleu: Option<f32>,
    next_epoch: usize,
}

impl<'a, M, D, S> Trainer<'a, M, D, S>
where
    M: TranslationModel,
    D: OneBestDecoder + ?Sized,
    S: SentenceScorer + ?Sized,
{
    /// Validates `config` and builds the three optimizers over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] for a bad config or an empty
    /// store.
    pub fn new(
        model: &'a M,
        store: ParameterStore,
        decoder: &'a D,
        scorer: &'a S,
        config: TrainConfig,
    ) -> Result<Self, AgonError> {
        config.validate()?;
        let vars = store.all_vars();
        if vars.is_empty() {
            return Err(AgonError::InvalidConfig {
                message: "parameter store has no variables".to_string(),
            });
        }
        let discriminator = PhaseOptimizer::new(DISCRIMINATOR, vars.clone(), &config.discriminator)?;
        let supervised = PhaseOptimizer::new(SUPERVISED, vars.clone(), &config.supervised)?;
        let reinforcement = PhaseOptimizer::new(REINFORCEMENT, vars, &config.reinforcement)?;
        let correlation = PairwiseCorrelation {
            lambda: config.reward_sharpness,
            ..PairwiseCorrelation::default()
        };
        info!(
            "trainer ready: {} parameters, epochs {}..={}, sampling {:?}, distance {:?}",
            store.element_count(),
            config.start_epoch,
            config.max_epochs,
            config.sampling.strategy,
            config.distance
        );
        Ok(Self {
            model,
            decoder,
            scorer,
            store,
            rng: seeded(config.seed),
            next_epoch: config.start_epoch,
            config,
            discriminator,
            supervised,
            reinforcement,
            correlation,
            best_valid_bleu: None,
        })
    }

    /// The frozen configuration.
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// The shared parameter store.
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// First epoch the next call to [`Trainer::train`] runs.
    pub fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    /// The optimizers in phase order.
    pub fn optimizers(&self) -> [&PhaseOptimizer; 3] {
        [&self.discriminator, &self.supervised, &self.reinforcement]
    }

    /// Runs epochs `next_epoch..=max_epochs` over `batches`, validating on
    /// `valid` at each epoch end when given.
    ///
    /// `next_epoch` starts at `start_epoch`, moves past a restored
    /// checkpoint's epoch, and advances as epochs finish.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Data`] if `batches` is empty and propagates any
    /// phase failure.
    pub fn train(&mut self, batches: &[Batch], valid: Option<&[Batch]>) -> Result<TrainReport, AgonError> {
        if batches.is_empty() {
            return Err(AgonError::Data {
                message: "no training batches".to_string(),
            });
        }
        let mut epochs = Vec::new();
        for epoch in self.next_epoch..=self.config.max_epochs {
            info!("epoch {epoch}/{} start, {} batches", self.config.max_epochs, batches.len());
            let probe = self.probe(batches)?;
            let mut report = EpochReport {
                epoch,
                probe,
                ..EpochReport::default()
            };
            if let Some(p) = probe {
                info!(
                    "probe BLEU on {}/{} random batches ({} sentences): {:.4}",
                    p.batches,
                    batches.len(),
                    p.sentences,
                    p.bleu
                );
                if p.bleu > self.config.probe.bleu_threshold {
                    info!("probe BLEU above {}, stopping", self.config.probe.bleu_threshold);
                    epochs.push(report);
                    return Ok(TrainReport {
                        outcome: TrainOutcome::Saturated { epoch, bleu: p.bleu },
                        epochs,
                    });
                }
            } else {
                warn!(
                    "probe selected no batches ({} x {}), skipping saturation check",
                    self.config.probe.percentage,
                    batches.len()
                );
            }

            let mut weighted_sum = 0.0f32;
            let (mut nll_sum, mut token_sum) = (0.0f32, 0usize);
            let mut bleu_sum = 0.0f32;
            for (bid, batch) in batches.iter().enumerate() {
                let last = bid + 1 == batches.len();
                let b = self.train_batch(batch, epoch, bid, batches.len(), last)?;
                report.batches += 1;
                report.discriminator_steps += b.discriminator.len();
                report.supervised_steps += b.supervised.len();
                report.reinforce_steps += b.reinforcement.len();
                if b.reinforcement.is_empty() && self.config.reinforce_iters > 0 {
                    report.reinforce_skipped += 1;
                }
                weighted_sum += b.discriminator.iter().map(|d| d.weighted).sum::<f32>();
                for s in &b.supervised {
                    nll_sum += s.nll;
                    token_sum += s.tokens;
                }
                bleu_sum += b.reinforcement.iter().map(|r| r.mean_bleu).sum::<f32>();
            }
            report.mean_weighted_distance = weighted_sum / report.discriminator_steps.max(1) as f32;
            report.word_nll = nll_sum / token_sum.max(1) as f32;
            report.mean_reinforce_bleu = bleu_sum / report.reinforce_steps.max(1) as f32;

            if let Some(valid) = valid.filter(|v| !v.is_empty()) {
                let bleu = self.validate(valid)?;
                report.valid_bleu = Some(bleu);
                self.discriminator.update_learning_rate(bleu, epoch);
                self.supervised.update_learning_rate(bleu, epoch);
                self.reinforcement.update_learning_rate(bleu, epoch);
                if self.best_valid_bleu.map_or(true, |best| bleu > best) {
                    self.best_valid_bleu = Some(bleu);
                    self.save_checkpoint(epoch, batches.len(), Some(bleu))?;
                }
            } else if self.config.checkpoint.save_every_epoch {
                self.save_checkpoint(epoch, batches.len(), None)?;
            }

            info!(
                "epoch {epoch} done: W-MLE {:.4}, weighted distance {:.4}, rl BLEU {:.4}, valid BLEU {:?}",
                report.word_nll, report.mean_weighted_distance, report.mean_reinforce_bleu, report.valid_bleu
            );
            epochs.push(report);
            self.next_epoch = epoch + 1;
        }
        Ok(TrainReport {
            outcome: TrainOutcome::Completed,
            epochs,
        })
    }

    fn probe(&mut self, batches: &[Batch]) -> Result<Option<ProbeResult>, AgonError> {
        let sampler = SearchSampler::new(self.decoder, self.config.sampling.decode_threads);
        bleu_probe(
            batches,
            &sampler,
            self.scorer,
            self.config.probe.percentage,
            self.config.probe.max_len,
            &mut self.rng,
        )
    }

    /// Runs every phase on one batch. `last` marks the final batch of the
    /// epoch, whose reinforcement phase is skipped.
    ///
    /// # Errors
    ///
    /// Propagates phase failures.
    pub fn train_batch(
        &mut self,
        batch: &Batch,
        epoch: usize,
        bid: usize,
        batch_count: usize,
        last: bool,
    ) -> Result<BatchReport, AgonError> {
        let mut report = BatchReport::default();
        for _ in 0..self.config.discriminator_iters {
            let d = self.discriminator_step(batch)?;
            debug!("discriminator distance {:.6} (weighted {:.6})", d.loss, d.weighted);
            report.discriminator.push(d);
        }
        for _ in 0..self.config.supervised_iters {
            let s = self.supervised_step(batch)?;
            debug!(
                "Epo:{epoch:>2}/{:>2}, Bat:[{bid}/{batch_count}], W-MLE:{:4.2}, W-ppl:{:4.2}, S-MLE:{:4.2}",
                self.config.max_epochs,
                s.word_nll(),
                s.word_perplexity(),
                s.sentence_nll()
            );
            report.supervised.push(s);
        }
        if last {
            debug!("skipping reinforcement on the last batch of epoch {epoch}");
        } else {
            for _ in 0..self.config.reinforce_iters {
                let r = self.reinforce_step(batch)?;
                debug!(
                    "mean BLEU {:.4}, rl loss {:.4}, rho {:.4}, batch BLEU {:.4}",
                    r.mean_bleu, r.loss, r.rho, r.batch_bleu
                );
                report.reinforcement.push(r);
            }
        }
        Ok(report)
    }

    /// Draws hypotheses with the configured strategy. Gumbel sampling
    /// draws from `gold_features` and also returns the noise.
    fn sample(
        &mut self,
        batch: &Batch,
        gold_features: &Tensor,
        max_len: usize,
    ) -> Result<(HypothesisSet, Option<Tensor>), AgonError> {
        match self.config.sampling.strategy {
            SamplingStrategy::Search => {
                let sampler = SearchSampler::new(self.decoder, self.config.sampling.decode_threads);
                Ok((sampler.sample(batch, max_len)?, None))
            }
            SamplingStrategy::Gumbel => {
                let logits = self.model.classifier().logits(&gold_features.detach())?;
                let draw = gumbel_sample(&logits, &mut self.rng)?;
                Ok((draw.hypotheses, Some(draw.noise)))
            }
        }
    }

    /// Hypothesis-conditioned probabilities, aligned to `max_len` with
    /// uniform rows past each hypothesis' end.
    fn hypothesis_probabilities(
        &self,
        batch: &Batch,
        hyps: &HypothesisSet,
        noise: Option<&Tensor>,
    ) -> Result<Tensor, AgonError> {
        let features = self
            .model
            .forward(batch.src(), hyps.tokens(), batch.src_mask(), hyps.mask())?;
        let head = self.model.classifier();
        let temperature = noise.map(|_| self.config.sampling.gumbel_temperature);
        let probs = head.to_probabilities(&features, noise, temperature)?;
        align(
            batch.batch_size(),
            hyps.max_len(),
            head.vocab_size(),
            &probs,
            hyps.lengths(),
        )
    }

    fn gold_features(&self, batch: &Batch) -> Result<Tensor, AgonError> {
        self.model.forward(
            batch.src(),
            &batch.gold_feed()?,
            batch.src_mask(),
            &batch.gold_feed_mask()?,
        )
    }

    /// One discriminator update.
    ///
    /// # Errors
    ///
    /// Propagates model, sampler and tensor failures.
    pub fn discriminator_step(&mut self, batch: &Batch) -> Result<DiscriminatorStats, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("discriminator_step", e);
        let gold_features = self.gold_features(batch)?;
        let p_gold = self.model.classifier().to_probabilities(&gold_features, None, None)?;
        let y_max_len = batch.trg_len() - 1;
        let (hyps, noise) = self.sample(batch, &gold_features, y_max_len)?;
        let p_hyp = self.hypothesis_probabilities(batch, &hyps, noise.as_ref())?;
        let gold = batch.gold_output()?;
        let d = distance(&p_gold, &p_hyp, hyps.mask(), self.config.distance, Some(&gold))?;
        let loss = d.loss.to_vec0::<f32>().map_err(map_err)?;
        let grad_norm = self.discriminator.backward_step(&d.loss)?;
        Ok(DiscriminatorStats {
            loss,
            weighted: d.weighted,
            grad_norm,
        })
    }

    /// One supervised update.
    ///
    /// # Errors
    ///
    /// Propagates model and tensor failures.
    pub fn supervised_step(&mut self, batch: &Batch) -> Result<SupervisedStats, AgonError> {
        let features = self.gold_features(batch)?;
        let mut sharded = sharded_cross_entropy(
            &features,
            &batch.gold_output()?,
            &batch.gold_output_mask()?,
            self.model.classifier(),
            &self.store.all_vars(),
            &self.config.shard_options(),
        )?;
        let grad_norm = self.supervised.step(&mut sharded.grads)?;
        Ok(SupervisedStats {
            nll: sharded.nll,
            tokens: sharded.tokens,
            correct: sharded.correct,
            sentences: batch.batch_size(),
            grad_norm,
        })
    }

    /// One reinforcement update.
    ///
    /// # Errors
    ///
    /// Propagates model, sampler and tensor failures.
    pub fn reinforce_step(&mut self, batch: &Batch) -> Result<ReinforceStats, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("reinforce_step", e);
        let y_max_len = batch.trg_len() - 1;
        let (hyps, noise) = match self.config.sampling.strategy {
            SamplingStrategy::Search => {
                let sampler = SearchSampler::new(self.decoder, self.config.sampling.decode_threads);
                (sampler.sample(batch, y_max_len)?, None)
            }
            SamplingStrategy::Gumbel => {
                let gold_features = self.gold_features(batch)?;
                self.sample(batch, &gold_features, y_max_len)?
            }
        };

        let b = batch.batch_size();
        let bleus: Vec<f32> = (0..b)
            .map(|j| self.scorer.sentence_bleu(hyps.content(j), batch.reference_tokens(j)))
            .collect();
        let hyp_rows: Vec<Vec<u32>> = (0..b).map(|j| hyps.content(j).to_vec()).collect();
        let ref_rows: Vec<Vec<u32>> = (0..b).map(|j| batch.reference_tokens(j).to_vec()).collect();
        let batch_bleu = self.scorer.corpus_bleu(&hyp_rows, &ref_rows);

        let p_hyp = self.hypothesis_probabilities(batch, &hyps, noise.as_ref())?;
        let confidence = sentence_confidence(&p_hyp, hyps.tokens(), hyps.mask())?;
        let out = self.correlation.loss(&confidence, &bleus)?;
        let loss = out.loss.to_vec0::<f32>().map_err(map_err)?;
        let grad_norm = self.reinforcement.backward_step(&out.loss)?;
        Ok(ReinforceStats {
            loss,
            rho: out.rho,
            mean_bleu: bleus.iter().sum::<f32>() / b.max(1) as f32,
            batch_bleu,
            grad_norm,
        })
    }

    /// Corpus BLEU of one-best translations of `batches`.
    ///
    /// # Errors
    ///
    /// Propagates decoder failures.
    pub fn validate(&self, batches: &[Batch]) -> Result<f32, AgonError> {
        let sampler = SearchSampler::new(self.decoder, self.config.sampling.decode_threads);
        let mut hypotheses = Vec::new();
        let mut references = Vec::new();
        for batch in batches {
            let hyps = sampler.sample(batch, self.config.probe.max_len)?;
            for j in 0..batch.batch_size() {
                hypotheses.push(hyps.content(j).to_vec());
                references.push(batch.reference_tokens(j).to_vec());
            }
        }
        let bleu = self.scorer.corpus_bleu(&hypotheses, &references);
        info!("validation BLEU on {} sentences: {bleu:.4}", hypotheses.len());
        Ok(bleu)
    }

    /// Writes the store and optimizer schedules under the configured prefix.
    ///
    /// # Errors
    ///
    /// Propagates checkpoint failures.
    pub fn save_checkpoint(
        &self,
        epoch: usize,
        batch: usize,
        valid_bleu: Option<f32>,
    ) -> Result<CheckpointPaths, AgonError> {
        let optimizers: BTreeMap<String, _> = self
            .optimizers()
            .iter()
            .map(|o| (o.name().to_string(), o.state()))
            .collect();
        let record = CheckpointRecord {
            epoch,
            batch,
            valid_bleu,
            optimizers,
        };
        checkpoint::save(&self.store, &record, &self.config.checkpoint.stem(epoch, batch))
    }

    /// Loads weights and optimizer schedules saved under `stem`; training
    /// then resumes with the epoch after the saved one.
    ///
    /// # Errors
    ///
    /// Propagates checkpoint failures.
    pub fn restore(&mut self, stem: &Path, device: &Device) -> Result<CheckpointRecord, AgonError> {
        let record = checkpoint::load(&self.store, stem, device)?;
        for opt in [&mut self.discriminator, &mut self.supervised, &mut self.reinforcement] {
            if let Some(state) = record.optimizers.get(opt.name()) {
                opt.restore(state);
            }
        }
        self.best_valid_bleu = record.valid_bleu;
        self.next_epoch = record.epoch + 1;
        Ok(record)
    }
}
