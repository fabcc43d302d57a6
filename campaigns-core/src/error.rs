//! Error types for campaigns-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from the data model, the state engine, and the
/// store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Expected absence of a row. Callers branch on this variant; it is never
    /// logged as a failure.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Input that cannot be interpreted (e.g. a changeset without a known
    /// creation time handed to the state engine).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Data inconsistent with the model's guarantees. Always a bug signal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A mutex guarding store state was poisoned by a panicking holder.
    #[error("store lock poisoned: {0}")]
    Poisoned(&'static str),

    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error from the store snapshot.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Campaign spec file failed to parse; includes file path and line context.
    #[error("failed to parse campaign spec at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl CoreError {
    /// Convenience constructor for [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
