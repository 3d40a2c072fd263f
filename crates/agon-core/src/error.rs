//! Error type shared by every agon crate.

use thiserror::Error;

/// Errors produced anywhere in the training pipeline.
///
/// Variants carry enough context to locate the failing operation without a
/// backtrace. Tensor-library failures are folded into [`AgonError::Internal`]
/// at the call site, prefixed with the name of the operation that failed.
///
/// # Example
///
/// ```
/// use agon_core::AgonError;
///
/// let err = AgonError::ShapeMismatch {
///     what: "mask batch dimension".to_string(),
///     expected: 4,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("mask batch dimension"));
/// ```
#[derive(Debug, Error)]
pub enum AgonError {
    /// A tensor operation or other internal step failed.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Two tensors that must agree on a dimension do not.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// A gold-token distance was requested without gold tokens.
    #[error("sentence-level KL requires gold token ids")]
    MissingGold,

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Reading or writing a file failed.
    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },

    /// Training data is empty or malformed.
    #[error("data error: {message}")]
    Data { message: String },

    /// A checkpoint could not be written or restored.
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },
}

impl AgonError {
    /// Builds an [`AgonError::Internal`] from any displayable error,
    /// prefixed with the operation name.
    pub fn internal(op: &str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: format!("{op}: {err}"),
        }
    }

    /// Builds an [`AgonError::Io`] for `path`.
    pub fn io(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}
