use thiserror::Error;

use crate::types::RecordId;

/// Errors returned by `RecordStore` operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("record {0} has no earlier version to undo to")]
    NoHistory(RecordId),

    #[error("record {0} has no later version to redo to")]
    NoFuture(RecordId),

    /// A replicated snapshot conflicts with local state at an equal or newer
    /// revision. Only a full sync from the primary reconciles the record.
    #[error("record {id} diverged: local revision {local}, incoming revision {incoming}")]
    Diverged { id: RecordId, local: u64, incoming: u64 },

    /// The storage medium failed. Not recoverable by the caller.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
