//! Error kinds for the retrieval core
//!
//! Validation failures are raised before any storage access. NotFound and
//! Storage stay distinct so callers never mistake a missing pattern for a
//! broken backend. Quantile non-convergence is not an error: it surfaces as
//! a low-confidence flag on the trust score.

/// Errors surfaced by the pattern-intel core.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("pattern not found: {id}")]
    NotFound { id: String },

    #[error("storage failure: {reason}")]
    Storage { reason: String },

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, PatternError>;

impl PatternError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// True for failures that a caller can fix by changing its input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<rusqlite::Error> for PatternError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for PatternError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(format!("corrupt pattern record: {}", err))
    }
}

impl From<tokio::task::JoinError> for PatternError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::storage(format!("storage task aborted: {}", err))
    }
}
