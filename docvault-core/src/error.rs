//! Error taxonomy shared by every document operation.

use std::path::PathBuf;
use std::sync::Arc;

use crate::document::DocumentState;

/// Errors surfaced by document operations.
///
/// Values are cheap to clone so the same failure can be stored as
/// `last_read_error`/`last_write_error`, returned to the caller and published
/// on the event bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    /// Content could not be read: missing item, malformed bytes, codec rejection.
    #[error("failed to read {}: {reason}", location.display())]
    Read {
        location: PathBuf,
        reason: Arc<anyhow::Error>,
    },
    /// Content could not be written: codec failure, disk full, denied access.
    #[error("failed to write {}: {reason}", location.display())]
    Write {
        location: PathBuf,
        reason: Arc<anyhow::Error>,
    },
    /// The coordination service could not grant access.
    #[error("coordination failed for {}: {reason}", location.display())]
    Coordination {
        location: PathBuf,
        reason: Arc<anyhow::Error>,
    },
    #[error("cannot {operation} while document is {state}")]
    InvalidState {
        operation: &'static str,
        state: DocumentState,
    },
    #[error("document is read-only")]
    ReadOnly,
    #[error("editing is disabled")]
    EditingDisabled,
    #[error(transparent)]
    Token(#[from] TokenError),
    /// The document's work queue has shut down.
    #[error("document queue closed")]
    QueueClosed,
}

impl DocumentError {
    pub fn read(location: impl Into<PathBuf>, reason: impl Into<anyhow::Error>) -> Self {
        DocumentError::Read {
            location: location.into(),
            reason: Arc::new(reason.into()),
        }
    }

    pub fn write(location: impl Into<PathBuf>, reason: impl Into<anyhow::Error>) -> Self {
        DocumentError::Write {
            location: location.into(),
            reason: Arc::new(reason.into()),
        }
    }

    pub fn coordination(location: impl Into<PathBuf>, reason: impl Into<anyhow::Error>) -> Self {
        DocumentError::Coordination {
            location: location.into(),
            reason: Arc::new(reason.into()),
        }
    }

    pub fn is_read_failure(&self) -> bool {
        matches!(self, DocumentError::Read { .. })
    }

    pub fn is_write_failure(&self) -> bool {
        matches!(self, DocumentError::Write { .. })
    }

    pub fn is_coordination_failure(&self) -> bool {
        matches!(self, DocumentError::Coordination { .. })
    }
}

/// Change-token comparison failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("change tokens use different attribute sets ({left} vs {right})")]
    IncompatibleVersions { left: String, right: String },
    #[error("cannot derive change token for {path}: {reason}")]
    Unavailable { path: String, reason: String },
}

pub type Result<T, E = DocumentError> = std::result::Result<T, E>;
