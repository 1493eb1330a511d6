//! Error types for the dedupvault engine.

use crate::kvstore::StoreError;
use crate::record::RecordId;

/// All errors surfaced by the deduplication engine.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Caller input was rejected before any persistence attempt.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The record store or blob store could not persist or read state.
    #[error("storage failure: {0}")]
    StorageFailure(String),
    /// No record exists with the given id.
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// Delete refused: the canonical record is still referenced by duplicates.
    #[error("record {id} is canonical for {duplicates} duplicate(s) and cannot be deleted")]
    HasDuplicates {
        /// Canonical record that was asked to be deleted.
        id: RecordId,
        /// Number of duplicates still referencing it.
        duplicates: usize,
    },
    /// Reading the caller's byte stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration, or a store opened with an incompatible configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure classes for adapters mapping errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with corrected input.
    InvalidInput,
    /// Backend failure; retry safety unknown.
    StorageFailure,
    /// Expected "no such record" outcome.
    NotFound,
    /// Request conflicts with current state.
    Conflict,
}

impl DedupError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::InvalidInput(_) | DedupError::Io(_) | DedupError::Config(_) => {
                ErrorKind::InvalidInput
            }
            DedupError::StorageFailure(_) => ErrorKind::StorageFailure,
            DedupError::NotFound(_) => ErrorKind::NotFound,
            DedupError::HasDuplicates { .. } => ErrorKind::Conflict,
        }
    }
}

impl From<StoreError> for DedupError {
    fn from(e: StoreError) -> Self {
        DedupError::StorageFailure(e.to_string())
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, DedupError>;
