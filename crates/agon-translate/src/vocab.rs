//! Word vocabulary with frequency cut-off.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use agon_core::tokens::{is_structural, SPECIAL_WORDS, UNK};
use agon_core::AgonError;
use tracing::info;

/// Bidirectional word/id map.
///
/// Ids 0-3 are always PAD, UNK, BOS and EOS; regular words follow in
/// descending frequency order (ties broken alphabetically).
///
/// # Example
///
/// ```
/// use agon_translate::Vocab;
///
/// let vocab = Vocab::from_lines(["a b b", "b c"], 100);
/// assert_eq!(vocab.len(), 4 + 3);
/// let ids = vocab.encode("b a zzz");
/// assert_eq!(vocab.decode(&ids), "b a <unk>");
/// ```
#[derive(Debug, Clone)]
pub struct Vocab {
    words: Vec<String>,
    counts: Vec<u64>,
    index: HashMap<String, u32>,
}

impl Vocab {
    /// Counts words in `lines` and keeps at most `max_size` entries,
    /// reserved symbols included.
    pub fn from_lines<I, S>(lines: I, max_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut freq: HashMap<String, u64> = HashMap::new();
        for line in lines {
            for word in line.as_ref().split_whitespace() {
                *freq.entry(word.to_string()).or_insert(0) += 1;
            }
        }
        let total: u64 = freq.values().sum();

        let mut ranked: Vec<(String, u64)> = freq
            .into_iter()
            .filter(|(w, _)| !SPECIAL_WORDS.contains(&w.as_str()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_size.saturating_sub(SPECIAL_WORDS.len()));

        let kept: u64 = ranked.iter().map(|(_, c)| c).sum();
        if total > 0 {
            info!(
                "vocabulary keeps {kept}/{total} running words ({:.2}%)",
                kept as f64 / total as f64 * 100.0
            );
        }

        let mut vocab = Self::specials_only();
        for (word, count) in ranked {
            vocab.push(word, count);
        }
        vocab
    }

    /// Loads `vocab_file` if it exists, otherwise counts `data_file`, keeps
    /// `max_size` entries and writes the result to `vocab_file`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] if either file cannot be read or written.
    pub fn extract(data_file: &Path, vocab_file: &Path, max_size: usize) -> Result<Self, AgonError> {
        if vocab_file.exists() {
            info!("loading vocabulary from {}", vocab_file.display());
            return Self::load(vocab_file);
        }
        let text = fs::read_to_string(data_file).map_err(|e| AgonError::io(data_file, e))?;
        let vocab = Self::from_lines(text.lines(), max_size);
        vocab.save(vocab_file)?;
        info!("saved vocabulary ({} entries) to {}", vocab.len(), vocab_file.display());
        Ok(vocab)
    }

    fn specials_only() -> Self {
        let mut vocab = Self {
            words: Vec::new(),
            counts: Vec::new(),
            index: HashMap::new(),
        };
        for word in SPECIAL_WORDS {
            vocab.push(word.to_string(), 0);
        }
        vocab
    }

    fn push(&mut self, word: String, count: u64) {
        let id = self.words.len() as u32;
        self.index.insert(word.clone(), id);
        self.words.push(word);
        self.counts.push(count);
    }

    /// Number of entries, reserved symbols included.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True if only the reserved symbols are present.
    pub fn is_empty(&self) -> bool {
        self.words.len() <= SPECIAL_WORDS.len()
    }

    /// Id of `word`, or UNK.
    pub fn id(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK)
    }

    /// Surface form of `id`, or `<unk>` for out-of-range ids.
    pub fn word(&self, id: u32) -> &str {
        self.words
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(SPECIAL_WORDS[UNK as usize])
    }

    /// Whitespace-tokenizes `sentence` into ids.
    pub fn encode(&self, sentence: &str) -> Vec<u32> {
        sentence.split_whitespace().map(|w| self.id(w)).collect()
    }

    /// Joins the words of `ids`, skipping PAD, BOS and EOS.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| !is_structural(id))
            .map(|&id| self.word(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Writes one `word<TAB>count` line per entry, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), AgonError> {
        let mut file = fs::File::create(path).map_err(|e| AgonError::io(path, e))?;
        for (word, count) in self.words.iter().zip(&self.counts) {
            writeln!(file, "{word}\t{count}").map_err(|e| AgonError::io(path, e))?;
        }
        Ok(())
    }

    /// Reads a file written by [`Vocab::save`].
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Io`] on read failure and [`AgonError::Data`] if
    /// the reserved symbols are missing or out of place.
    pub fn load(path: &Path) -> Result<Self, AgonError> {
        let file = fs::File::open(path).map_err(|e| AgonError::io(path, e))?;
        let mut vocab = Self {
            words: Vec::new(),
            counts: Vec::new(),
            index: HashMap::new(),
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AgonError::io(path, e))?;
            if line.is_empty() {
                continue;
            }
            let (word, count) = match line.split_once('\t') {
                Some((w, c)) => (w, c.trim().parse().unwrap_or(0)),
                None => (line.as_str(), 0),
            };
            vocab.push(word.to_string(), count);
        }
        for (id, special) in SPECIAL_WORDS.iter().enumerate() {
            if vocab.words.get(id).map(String::as_str) != Some(*special) {
                return Err(AgonError::Data {
                    message: format!("{}: expected {special} at id {id}", path.display()),
                });
            }
        }
        Ok(vocab)
    }
}
