//! Line-aligned parallel corpus loading and batching.

use std::fs;
use std::path::Path;

use agon_core::rng::seeded;
use agon_core::{AgonError, Batch};
use candle_core::Device;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::vocab::Vocab;

/// Corpus filtering and ordering options.
#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Pairs with either side longer than this many words are dropped (default: 50).
    pub max_seq_len: usize,
    /// Shuffle pairs after loading (default: true).
    pub shuffle: bool,
    /// Sort pairs by ascending source length after shuffling (default: true).
    pub sort_by_length: bool,
    /// Seed for the shuffle.
    pub seed: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 50,
            shuffle: true,
            sort_by_length: true,
            seed: 1234,
        }
    }
}

/// Counts gathered while reading a corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusStats {
    /// Lines read.
    pub total: usize,
    /// Lines skipped because one side was blank.
    pub blank: usize,
    /// Lines dropped for exceeding `max_seq_len`.
    pub too_long: usize,
}

impl CorpusStats {
    /// Pairs kept.
    pub fn kept(&self) -> usize {
        self.total - self.blank - self.too_long
    }
}

/// Encoded `(source, target)` id pairs.
///
/// # Example
///
/// ```
/// use agon_translate::{CorpusConfig, ParallelCorpus, Vocab};
/// use candle_core::Device;
///
/// let src = ["a b", "", "c"];
/// let trg = ["x", "y", "z z"];
/// let sv = Vocab::from_lines(src, 100);
/// let tv = Vocab::from_lines(trg, 100);
/// let config = CorpusConfig { shuffle: false, ..CorpusConfig::default() };
/// let corpus = ParallelCorpus::from_lines(&src, &trg, &sv, &tv, &config).unwrap();
/// assert_eq!(corpus.len(), 2);
/// assert_eq!(corpus.stats().blank, 1);
/// let batches = corpus.batches(8, &Device::Cpu).unwrap();
/// assert_eq!(batches.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ParallelCorpus {
    pairs: Vec<(Vec<u32>, Vec<u32>)>,
    stats: CorpusStats,
}

impl ParallelCorpus {
    /// Reads two line-aligned files.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] if a file cannot be read, and
    /// [`AgonError::Data`] if the line counts differ or nothing survives
    /// filtering.
    pub fn load(
        src_path: &Path,
        trg_path: &Path,
        src_vocab: &Vocab,
        trg_vocab: &Vocab,
        config: &CorpusConfig,
    ) -> Result<Self, AgonError> {
        let src_text = fs::read_to_string(src_path).map_err(|e| AgonError::io(src_path, e))?;
        let trg_text = fs::read_to_string(trg_path).map_err(|e| AgonError::io(trg_path, e))?;
        let src_lines: Vec<&str> = src_text.lines().collect();
        let trg_lines: Vec<&str> = trg_text.lines().collect();
        info!(
            "reading parallel corpus {} / {}",
            src_path.display(),
            trg_path.display()
        );
        Self::from_lines(&src_lines, &trg_lines, src_vocab, trg_vocab, config)
    }

    /// Encodes in-memory line pairs.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Data`] if the line counts differ or nothing
    /// survives filtering.
    pub fn from_lines(
        src_lines: &[&str],
        trg_lines: &[&str],
        src_vocab: &Vocab,
        trg_vocab: &Vocab,
        config: &CorpusConfig,
    ) -> Result<Self, AgonError> {
        if src_lines.len() != trg_lines.len() {
            return Err(AgonError::Data {
                message: format!(
                    "source has {} lines but target has {}",
                    src_lines.len(),
                    trg_lines.len()
                ),
            });
        }

        let mut stats = CorpusStats::default();
        let mut pairs = Vec::with_capacity(src_lines.len());
        for (i, (src, trg)) in src_lines.iter().zip(trg_lines).enumerate() {
            stats.total += 1;
            let (src, trg) = (src.trim(), trg.trim());
            if src.is_empty() || trg.is_empty() {
                warn!("ignoring blank sentence at line {}", i + 1);
                stats.blank += 1;
                continue;
            }
            let src_ids = src_vocab.encode(src);
            let trg_ids = trg_vocab.encode(trg);
            if src_ids.len() > config.max_seq_len || trg_ids.len() > config.max_seq_len {
                stats.too_long += 1;
                continue;
            }
            pairs.push((src_ids, trg_ids));
        }
        info!(
            "sentence pairs: {} total - {} blank - {} too long = {}",
            stats.total,
            stats.blank,
            stats.too_long,
            stats.kept()
        );
        if pairs.is_empty() {
            return Err(AgonError::Data {
                message: "no sentence pairs left after filtering".to_string(),
            });
        }

        if config.shuffle {
            pairs.shuffle(&mut seeded(config.seed));
        }
        if config.sort_by_length {
            // stable, so shuffled order survives within equal lengths
            pairs.sort_by_key(|(src, _)| src.len());
        }
        Ok(Self { pairs, stats })
    }

    /// Number of kept pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True if no pairs were kept.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Loading statistics.
    pub fn stats(&self) -> CorpusStats {
        self.stats
    }

    /// Encoded pairs in corpus order.
    pub fn pairs(&self) -> &[(Vec<u32>, Vec<u32>)] {
        &self.pairs
    }

    /// Splits the corpus into consecutive batches of at most `batch_size`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] if `batch_size` is zero.
    pub fn batches(&self, batch_size: usize, device: &Device) -> Result<Vec<Batch>, AgonError> {
        if batch_size == 0 {
            return Err(AgonError::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        self.pairs
            .chunks(batch_size)
            .map(|chunk| Batch::from_pairs(chunk, device))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabs(src: &[&str], trg: &[&str]) -> (Vocab, Vocab) {
        (Vocab::from_lines(src, 100), Vocab::from_lines(trg, 100))
    }

    #[test]
    fn drops_long_and_blank_pairs() {
        let src = ["a", "a b c d", "  ", "b"];
        let trg = ["x", "y", "z", "   "];
        let (sv, tv) = vocabs(&src, &trg);
        let config = CorpusConfig {
            max_seq_len: 3,
            ..CorpusConfig::default()
        };
        let corpus = ParallelCorpus::from_lines(&src, &trg, &sv, &tv, &config).unwrap();
        assert_eq!(
            corpus.stats(),
            CorpusStats {
                total: 4,
                blank: 2,
                too_long: 1
            }
        );
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn sorted_by_source_length() {
        let src = ["a b c", "a", "a b"];
        let trg = ["x", "y", "z"];
        let (sv, tv) = vocabs(&src, &trg);
        let corpus =
            ParallelCorpus::from_lines(&src, &trg, &sv, &tv, &CorpusConfig::default()).unwrap();
        let lens: Vec<usize> = corpus.pairs().iter().map(|(s, _)| s.len()).collect();
        assert_eq!(lens, vec![1, 2, 3]);
    }

    #[test]
    fn shuffle_follows_seed() {
        let words: Vec<String> = (0..20).map(|i| format!("w{i}")).collect();
        let lines: Vec<&str> = words.iter().map(String::as_str).collect();
        let (sv, tv) = vocabs(&lines, &lines);
        let order = |seed: u64| {
            let config = CorpusConfig {
                sort_by_length: false,
                seed,
                ..CorpusConfig::default()
            };
            let corpus = ParallelCorpus::from_lines(&lines, &lines, &sv, &tv, &config).unwrap();
            corpus.pairs().iter().map(|(s, _)| s[0]).collect::<Vec<u32>>()
        };
        assert_eq!(order(3), order(3));
        assert_ne!(order(3), order(4));
        let mut ids = order(3);
        ids.sort_unstable();
        let mut expected: Vec<u32> = lines.iter().map(|w| sv.id(w)).collect();
        expected.sort_unstable();
        assert_eq!(ids, expected);
    }

    #[test]
    fn mismatched_line_counts_fail() {
        let (sv, tv) = vocabs(&["a"], &["x"]);
        let err = ParallelCorpus::from_lines(&["a", "a"], &["x"], &sv, &tv, &CorpusConfig::default());
        assert!(matches!(err, Err(AgonError::Data { .. })));
    }

    #[test]
    fn load_from_files_and_batch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train.src");
        let trg = dir.path().join("train.trg");
        fs::write(&src, "a b\nc\nd e f\n").unwrap();
        fs::write(&trg, "x\ny y\nz\n").unwrap();
        let sv = Vocab::from_lines(["a b", "c", "d e f"], 100);
        let tv = Vocab::from_lines(["x", "y y", "z"], 100);
        let corpus = ParallelCorpus::load(&src, &trg, &sv, &tv, &CorpusConfig::default()).unwrap();
        let batches = corpus.batches(2, &Device::Cpu).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch_size(), 2);
        assert_eq!(batches[1].batch_size(), 1);
        assert!(corpus.batches(0, &Device::Cpu).is_err());
    }
}
