//! Reserved token ids and numeric guards.
//!
//! Every vocabulary built by agon places the four special symbols at the
//! same ids, so tensors can be compared against these constants directly.

/// Padding id. Never a valid prediction target.
pub const PAD: u32 = 0;

/// Out-of-vocabulary id.
pub const UNK: u32 = 1;

/// Beginning-of-sentence id. Every target and hypothesis starts with it.
pub const BOS: u32 = 2;

/// End-of-sentence id.
pub const EOS: u32 = 3;

/// Surface forms of the reserved symbols, indexed by id.
pub const SPECIAL_WORDS: [&str; 4] = ["<pad>", "<unk>", "<b>", "</s>"];

/// Guard added inside logarithms and to degenerate denominators.
pub const EPSILON: f64 = 1e-20;

/// Returns true for PAD, BOS and EOS, the ids stripped before scoring.
pub fn is_structural(id: u32) -> bool {
    id == PAD || id == BOS || id == EOS
}

/// Removes PAD, BOS and EOS from a token sequence.
///
/// # Example
///
/// ```
/// use agon_core::tokens::{strip_structural, BOS, EOS, PAD};
///
/// assert_eq!(strip_structural(&[BOS, 7, 9, EOS, PAD]), vec![7, 9]);
/// ```
pub fn strip_structural(ids: &[u32]) -> Vec<u32> {
    ids.iter().copied().filter(|&id| !is_structural(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_are_distinct() {
        let ids = [PAD, UNK, BOS, EOS];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(SPECIAL_WORDS.len(), ids.len());
    }

    #[test]
    fn strip_keeps_unk() {
        assert_eq!(strip_structural(&[BOS, UNK, EOS]), vec![UNK]);
        assert!(strip_structural(&[PAD, PAD]).is_empty());
    }
}
