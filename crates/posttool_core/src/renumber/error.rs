use rusqlite::ErrorCode;
use thiserror::Error;

use super::Stage;

/// Failure of a renumbering pass. Every variant implies the transaction was rolled back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RenumberError {
    /// Sequence numbers or references were in a state the engine must never produce or accept.
    #[error("sequence constraint violated during {stage}: {message}")]
    ConstraintViolation { stage: Stage, message: String },

    /// The store failed; nothing was changed and the pass can be retried from scratch.
    #[error("renumber transaction aborted during {stage}: {source}")]
    TransactionAborted {
        stage: Stage,
        #[source]
        source: rusqlite::Error,
    },

    /// The caller stopped the pass at a stage boundary.
    #[error("renumber interrupted after {stage}: {reason}")]
    Interrupted { stage: Stage, reason: String },
}

impl RenumberError {
    pub(crate) fn constraint(stage: Stage, message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            stage,
            message: message.into(),
        }
    }

    /// Classify a store error. Uniqueness failures are engine bugs, not store hiccups.
    pub(crate) fn from_store(stage: Stage, source: rusqlite::Error) -> Self {
        match source.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Self::ConstraintViolation {
                stage,
                message: source.to_string(),
            },
            _ => Self::TransactionAborted { stage, source },
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::ConstraintViolation { stage, .. }
            | Self::TransactionAborted { stage, .. }
            | Self::Interrupted { stage, .. } => *stage,
        }
    }

    /// Whether running the same pass again may succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransactionAborted { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            Self::ConstraintViolation { .. } | Self::Interrupted { .. } => false,
        }
    }
}

/// Shorthand for mapping rusqlite results at a given stage.
pub(crate) trait StoreResultExt<T> {
    fn at(self, stage: Stage) -> Result<T, RenumberError>;
}

impl<T> StoreResultExt<T> for rusqlite::Result<T> {
    fn at(self, stage: Stage) -> Result<T, RenumberError> {
        self.map_err(|source| RenumberError::from_store(stage, source))
    }
}
