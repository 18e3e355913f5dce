//! Error types for persistence operations.

use std::io;
use thiserror::Error;

use crate::types::{EntryId, PersistHandle};

/// Result type for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log already has an open transaction.
    #[error("persistence log is busy")]
    Busy,

    /// The handle does not name the open transaction.
    #[error("invalid persistence handle {handle}")]
    InvalidHandle {
        /// The rejected handle.
        handle: PersistHandle,
    },

    /// No record exists for the entry id.
    #[error("{entry_id} not found in persistence log")]
    EntryNotFound {
        /// The missing entry id.
        entry_id: EntryId,
    },

    /// A stored record is corrupted.
    #[error("persisted record corrupted: {0}")]
    Corrupted(String),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The log refused to commit or abort.
    #[error("log transaction failed: {0}")]
    TransactionFailed(String),
}

impl PersistError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates a transaction failure error.
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::TransactionFailed(message.into())
    }

    /// Returns true if the error is a busy rejection worth retrying.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}
