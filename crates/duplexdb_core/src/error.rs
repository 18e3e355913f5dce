//! Error types for DuplexDB core.

use crate::types::{ObjectId, TableKind, TransactionId, TransactionState};
use duplexdb_peer::PeerOperation;
use thiserror::Error;

/// Result type for core operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors that can occur in configuration transaction operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Persistence log error.
    #[error("persistence error: {0}")]
    Persist(#[from] duplexdb_persist::PersistError),

    /// Peer protocol error.
    #[error("peer protocol error: {0}")]
    Peer(#[from] duplexdb_peer::PeerError),

    /// CBOR codec error.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A transaction is already open.
    #[error("transaction {id} is already active")]
    AlreadyActive {
        /// The open transaction.
        id: TransactionId,
    },

    /// The transaction slot is not in a state that permits the operation.
    #[error("invalid transaction state: expected {expected}, found {actual}")]
    InvalidState {
        /// States that would have been accepted.
        expected: String,
        /// State found.
        actual: TransactionState,
    },

    /// A fixed-size table has no free slot.
    #[error("{table} table is full ({capacity} entries)")]
    CapacityExceeded {
        /// The full table.
        table: TableKind,
        /// Its capacity.
        capacity: usize,
    },

    /// An entry with the same key is already staged or present.
    #[error("duplicate {table} entry {key}")]
    DuplicateKey {
        /// Table of the entry.
        table: TableKind,
        /// Rendered key.
        key: String,
    },

    /// The entry cannot be staged in its current state.
    #[error("invalid entry: {message}")]
    InvalidEntry {
        /// Description of the problem.
        message: String,
    },

    /// The persistence log stayed busy through every retry.
    #[error("persistence log busy after {attempts} attempts")]
    Busy {
        /// Attempts made.
        attempts: u32,
    },

    /// A bounded wait elapsed.
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
    },

    /// The peer's transaction belongs to a different job.
    #[error("{operation} names job {remote_job}, local transaction belongs to job {local_job}")]
    ProtocolMismatch {
        /// Operation that was refused.
        operation: PeerOperation,
        /// Job of the transaction on this side.
        local_job: u64,
        /// Job named by the other side.
        remote_job: u64,
    },

    /// A message declared a larger body than this build understands.
    #[error("message declares {declared} bytes, at most {supported} supported")]
    VersionMismatch {
        /// Declared body size.
        declared: u32,
        /// Largest supported body size.
        supported: u32,
    },

    /// The persistence logs refused to commit.
    #[error("persist failure: {message}")]
    PersistFailure {
        /// Description of the failure.
        message: String,
    },

    /// The peer could not complete a replicated operation.
    #[error("peer failed {operation}: {message}")]
    PeerFailure {
        /// Operation that failed.
        operation: PeerOperation,
        /// Reason given or observed.
        message: String,
    },

    /// A named thing does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A live object is missing from the topology.
    #[error("{id} does not exist")]
    ObjectNotFound {
        /// The missing object.
        id: ObjectId,
    },

    /// A live object already exists in the topology.
    #[error("{id} already exists")]
    ObjectExists {
        /// The existing object.
        id: ObjectId,
    },

    /// The operation is only valid on the active controller.
    #[error("operation requires the active controller")]
    WrongRole,

    /// The configuration service is not ready.
    #[error("configuration service is not ready")]
    NotReady,
}

impl DatabaseError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(expected: &[TransactionState], actual: TransactionState) -> Self {
        let expected = expected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        Self::InvalidState { expected, actual }
    }

    /// Creates an invalid entry error.
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a persist failure error.
    pub fn persist_failure(message: impl Into<String>) -> Self {
        Self::PersistFailure {
            message: message.into(),
        }
    }

    /// Creates a peer failure error.
    pub fn peer_failure(operation: PeerOperation, message: impl Into<String>) -> Self {
        Self::PeerFailure {
            operation,
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}
