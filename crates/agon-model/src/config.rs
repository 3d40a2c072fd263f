//! Model dimensions.

use agon_core::AgonError;
use serde::{Deserialize, Serialize};

/// Layer sizes for [`crate::RnnSearch`].
///
/// # Example
///
/// ```
/// use agon_model::RnnSearchConfig;
///
/// let config = RnnSearchConfig::tiny(20, 30);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.trg_vocab, 30);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnnSearchConfig {
    /// Source vocabulary size, reserved ids included.
    pub src_vocab: usize,
    /// Target vocabulary size, reserved ids included.
    pub trg_vocab: usize,
    /// Source embedding width (default: 512).
    pub src_emb: usize,
    /// Target embedding width (default: 512).
    pub trg_emb: usize,
    /// Hidden size of each encoder direction (default: 512).
    pub enc_hidden: usize,
    /// Decoder hidden size (default: 512).
    pub dec_hidden: usize,
    /// Attention alignment width (default: 512).
    pub align: usize,
    /// Width of the features handed to the classifier (default: 512).
    pub out_size: usize,
    /// Maxout over pairs instead of tanh for the output layer (default: true).
    pub max_out: bool,
}

impl Default for RnnSearchConfig {
    fn default() -> Self {
        Self {
            src_vocab: 30_000,
            trg_vocab: 30_000,
            src_emb: 512,
            trg_emb: 512,
            enc_hidden: 512,
            dec_hidden: 512,
            align: 512,
            out_size: 512,
            max_out: true,
        }
    }
}

impl RnnSearchConfig {
    /// Small dimensions for tests and smoke runs.
    pub fn tiny(src_vocab: usize, trg_vocab: usize) -> Self {
        Self {
            src_vocab,
            trg_vocab,
            src_emb: 8,
            trg_emb: 8,
            enc_hidden: 8,
            dec_hidden: 8,
            align: 8,
            out_size: 8,
            max_out: true,
        }
    }

    /// Rejects zero-sized layers and vocabularies too small to hold the
    /// reserved ids.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), AgonError> {
        let dims = [
            ("src_emb", self.src_emb),
            ("trg_emb", self.trg_emb),
            ("enc_hidden", self.enc_hidden),
            ("dec_hidden", self.dec_hidden),
            ("align", self.align),
            ("out_size", self.out_size),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, d)| *d == 0) {
            return Err(AgonError::InvalidConfig {
                message: format!("model.{name} must be positive"),
            });
        }
        for (name, v) in [("src_vocab", self.src_vocab), ("trg_vocab", self.trg_vocab)] {
            if v <= agon_core::EOS as usize {
                return Err(AgonError::InvalidConfig {
                    message: format!("model.{name} = {v} cannot hold the reserved ids"),
                });
            }
        }
        Ok(())
    }
}
