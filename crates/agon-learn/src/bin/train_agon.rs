//! CLI binary for adversarial + reinforcement fine-tuning.
//!
//! Builds vocabularies and batches from parallel text, constructs the
//! reference RNNsearch model, optionally restores a checkpoint, runs the
//! three-phase trainer, and writes a final checkpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin train-agon -- --config run.toml
//! RUST_LOG=debug cargo run --bin train-agon -- --config run.toml --epochs 2
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use agon_core::AgonError;
use agon_learn::config::RunConfig;
use agon_learn::{ParameterStore, TrainOutcome, Trainer};
use agon_model::{GreedyDecoder, RnnSearch};
use agon_translate::{Bleu, ParallelCorpus, Vocab};
use candle_core::Device;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Fine-tune a translation model with adversarial and BLEU-correlation losses")]
struct Cli {
    /// Run configuration (.toml or .json); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training source text, overrides `data.train_src`
    #[arg(long)]
    train_src: Option<PathBuf>,

    /// Training target text, overrides `data.train_trg`
    #[arg(long)]
    train_trg: Option<PathBuf>,

    /// Validation source text, overrides `data.valid_src`
    #[arg(long, requires = "valid_trg")]
    valid_src: Option<PathBuf>,

    /// Validation target text, overrides `data.valid_trg`
    #[arg(long, requires = "valid_src")]
    valid_trg: Option<PathBuf>,

    /// Last epoch, overrides `train.max_epochs`
    #[arg(long)]
    epochs: Option<usize>,

    /// Random seed, overrides `train.seed`
    #[arg(long)]
    seed: Option<u64>,

    /// Checkpoint prefix, overrides `train.checkpoint.prefix`
    #[arg(long)]
    output: Option<PathBuf>,

    /// Checkpoint stem to restore before training
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn resolve(&self) -> Result<RunConfig, AgonError> {
        let mut run = match &self.config {
            Some(path) => RunConfig::from_path(path)?,
            None => RunConfig::default(),
        };
        if let Some(p) = &self.train_src {
            run.data.train_src = p.clone();
        }
        if let Some(p) = &self.train_trg {
            run.data.train_trg = p.clone();
        }
        if let Some(p) = &self.valid_src {
            run.data.valid_src = Some(p.clone());
        }
        if let Some(p) = &self.valid_trg {
            run.data.valid_trg = Some(p.clone());
        }
        if let Some(e) = self.epochs {
            run.train.max_epochs = e;
        }
        if let Some(s) = self.seed {
            run.train.seed = s;
        }
        if let Some(p) = &self.output {
            run.train.checkpoint.prefix = p.clone();
        }
        run.validate()?;
        Ok(run)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), AgonError> {
    let mut run = cli.resolve()?;
    if cli.print_config {
        let json = serde_json::to_string_pretty(&run).map_err(|e| AgonError::internal("print_config", e))?;
        println!("{json}");
        return Ok(());
    }

    let device = Device::cuda_if_available(0).map_err(|e| AgonError::internal("device", e))?;
    let data = &run.data;
    let src_vocab = Vocab::extract(&data.train_src, &data.src_vocab, data.src_vocab_size)?;
    let trg_vocab = Vocab::extract(&data.train_trg, &data.trg_vocab, data.trg_vocab_size)?;
    info!("vocabularies: source {}, target {}", src_vocab.len(), trg_vocab.len());

    let corpus_config = data.corpus_config(run.train.seed);
    let train = ParallelCorpus::load(&data.train_src, &data.train_trg, &src_vocab, &trg_vocab, &corpus_config)?;
    let batches = train.batches(data.batch_size, &device)?;
    let valid_batches = match (&data.valid_src, &data.valid_trg) {
        (Some(src), Some(trg)) => {
            let valid_config = agon_translate::CorpusConfig {
                shuffle: false,
                ..corpus_config.clone()
            };
            let valid = ParallelCorpus::load(src, trg, &src_vocab, &trg_vocab, &valid_config)?;
            Some(valid.batches(data.batch_size, &device)?)
        }
        _ => None,
    };
    info!(
        "training on {} sentence pairs in {} batches{}",
        train.len(),
        batches.len(),
        valid_batches
            .as_ref()
            .map(|v| format!(", validating on {} batches", v.len()))
            .unwrap_or_default()
    );

    run.model.src_vocab = src_vocab.len();
    run.model.trg_vocab = trg_vocab.len();
    let store = ParameterStore::new();
    let model = RnnSearch::new(store.var_map(), &run.model, &device)?;
    let decoder = GreedyDecoder::new(&model, run.train.probe.max_len);
    let scorer = Bleu::default();

    let mut trainer = Trainer::new(&model, store, &decoder, &scorer, run.train.clone())?;
    if let Some(stem) = &cli.restore {
        let record = trainer.restore(stem, &device)?;
        info!(
            "restored epoch {} (batch {}), resuming at epoch {}",
            record.epoch,
            record.batch,
            trainer.next_epoch()
        );
    }

    let report = trainer.train(&batches, valid_batches.as_deref())?;
    let last_epoch = report
        .epochs
        .last()
        .map_or(trainer.next_epoch().saturating_sub(1), |e| e.epoch);
    match report.outcome {
        TrainOutcome::Completed => info!("training completed after epoch {last_epoch}"),
        TrainOutcome::Saturated { epoch, bleu } => {
            info!("training stopped at epoch {epoch}: probe BLEU {bleu:.4} saturated")
        }
    }
    let valid_bleu = report.epochs.last().and_then(|e| e.valid_bleu);
    let paths = trainer.save_checkpoint(last_epoch, batches.len(), valid_bleu)?;
    info!("final weights in {}", paths.model.display());
    Ok(())
}
