//! Error types for deltavox
//!
//! One error enum covers the whole runtime. Construction-time failures
//! (container parsing, unsupported encodings, model-shape mismatches) abort
//! engine startup; delta and collaborator failures are reported but leave
//! the engine usable.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DeltavoxError>;

/// Errors produced by the inference runtime
#[derive(Debug, Error)]
pub enum DeltavoxError {
    /// Malformed or truncated container or archive
    #[error("Parse error in {context}: {reason}")]
    Parse {
        /// What was being parsed (e.g. "gguf header", "A.npy")
        context: String,
        /// Details about the failure
        reason: String,
    },

    /// Unrecognized tensor or array encoding
    #[error("Unsupported format: {what}")]
    UnsupportedFormat {
        /// Description of the unsupported encoding
        what: String,
    },

    /// Shapes that must agree do not
    #[error("Dimension mismatch: {reason}")]
    DimensionMismatch {
        /// Which dimensions disagreed and how
        reason: String,
    },

    /// Decode position reached the sequence limit
    #[error("Position {position} exceeds maximum sequence length {max_seq_len}")]
    RuntimeOverflow {
        /// Requested position
        position: usize,
        /// Configured sequence limit
        max_seq_len: usize,
    },

    /// File system failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A required tensor is absent from the container
    #[error("Missing tensor: {name}")]
    MissingTensor {
        /// Tensor name
        name: String,
    },

    /// Configuration value rejected during validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected
        reason: String,
    },

    /// `generate` was re-entered from the thread that already holds the engine
    #[error("Re-entrant generate call on the thread that owns the engine")]
    Reentrant,
}

impl DeltavoxError {
    /// Build a [`DeltavoxError::Parse`] from anything displayable
    pub(crate) fn parse(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`DeltavoxError::Io`] for `path`
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort engine construction
    ///
    /// Container-level failures are fatal. Runtime overflow, re-entrancy
    /// and configuration errors are reported to the caller instead.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::UnsupportedFormat { .. }
                | Self::DimensionMismatch { .. }
                | Self::MissingTensor { .. }
                | Self::Io { .. }
        )
    }
}
