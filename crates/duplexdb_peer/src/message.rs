//! Protocol messages exchanged between the two controllers.

use crate::error::{PeerError, PeerResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Current peer protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest request body, in bytes, this build understands.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

/// Transaction lifecycle operation replicated to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerOperation {
    /// A transaction was started.
    Start,
    /// An entry was staged into the transaction.
    Stage,
    /// The transaction committed; the peer folds it into memory.
    Commit,
    /// Commit whose entry ids travel in a bulk-transferred backup.
    CommitDma,
    /// The transaction was abandoned; the peer reverts its copy.
    Abort,
    /// The peer releases its transaction slot.
    Invalidate,
}

impl PeerOperation {
    /// Returns the operation's numeric code.
    #[must_use]
    pub const fn type_code(self) -> u8 {
        match self {
            Self::Start => 1,
            Self::Stage => 2,
            Self::Commit => 3,
            Self::CommitDma => 4,
            Self::Abort => 5,
            Self::Invalidate => 6,
        }
    }

    /// Converts a numeric code to an operation.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Start),
            2 => Some(Self::Stage),
            3 => Some(Self::Commit),
            4 => Some(Self::CommitDma),
            5 => Some(Self::Abort),
            6 => Some(Self::Invalidate),
            _ => None,
        }
    }

    /// Returns a lowercase name for logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::CommitDma => "commit_dma",
            Self::Abort => "abort",
            Self::Invalidate => "invalidate",
        }
    }
}

impl std::fmt::Display for PeerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decided entry ids per table, indexed by transaction slot.
///
/// Zero means the slot has no durable location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryIdMap {
    /// Object table slots.
    pub objects: Vec<u64>,
    /// User table slots.
    pub users: Vec<u64>,
    /// Edge table slots.
    pub edges: Vec<u64>,
    /// Global-info table slots.
    pub global_infos: Vec<u64>,
}

impl EntryIdMap {
    /// Returns the number of slots with a decided id.
    #[must_use]
    pub fn placed(&self) -> usize {
        [&self.objects, &self.users, &self.edges, &self.global_infos]
            .iter()
            .map(|ids| ids.iter().filter(|id| **id != 0).count())
            .sum()
    }
}

/// Identifying fields of a transaction plus its decided entry ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Raw transaction id.
    pub transaction_id: u64,
    /// Raw transaction state byte.
    pub state: u8,
    /// Raw transaction type byte.
    pub transaction_type: u8,
    /// Job the transaction belongs to.
    pub job_number: u64,
    /// Decided entry ids.
    pub entry_ids: EntryIdMap,
}

/// One staged entry, replicated so the peer holds the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRecord {
    /// Raw table kind byte.
    pub table: u8,
    /// Slot index within the table.
    pub slot: u32,
    /// Encoded entry.
    pub bytes: Vec<u8>,
}

/// A replication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequest {
    /// Requested operation.
    pub operation: PeerOperation,
    /// The requester's transaction.
    pub summary: TransactionSummary,
    /// Entry being staged, for [`PeerOperation::Stage`].
    pub staged: Option<StagedRecord>,
}

/// The peer's answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmStatus {
    /// The peer completed the requested state transition.
    Ok,
    /// The peer tried and failed.
    Failed {
        /// Why the peer failed.
        reason: String,
    },
    /// The request named a different job than the peer's transaction.
    MismatchedTransaction {
        /// Job number of the peer's own transaction.
        local_job: u64,
    },
    /// The request declared a larger body than the peer understands.
    LargerMessageSize {
        /// Largest body the peer understands.
        supported: u32,
    },
}

impl ConfirmStatus {
    /// Returns true for [`ConfirmStatus::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Version and declared body size carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHeader {
    /// Sender's protocol version.
    pub version: u16,
    /// Declared size of the body in bytes.
    pub size: u32,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerBody {
    /// A request to mirror a lifecycle step.
    Request(PeerRequest),
    /// Confirmation of an earlier request.
    Confirm {
        /// Operation being confirmed.
        operation: PeerOperation,
        /// Outcome on the peer.
        status: ConfirmStatus,
    },
}

/// A framed peer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Correlates a confirmation with its request.
    pub request_id: Uuid,
    /// Version header.
    pub header: VersionHeader,
    /// Message body.
    pub body: PeerBody,
}

impl PeerMessage {
    /// Creates a request message with a fresh request id.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded to measure it.
    pub fn request(request: PeerRequest) -> PeerResult<Self> {
        let body = PeerBody::Request(request);
        let size = u32::try_from(to_cbor(&body)?.len())
            .map_err(|_| PeerError::invalid_message("request body too large"))?;
        Ok(Self {
            request_id: Uuid::new_v4(),
            header: VersionHeader {
                version: PROTOCOL_VERSION,
                size,
            },
            body,
        })
    }

    /// Creates a confirmation for `request_id`.
    #[must_use]
    pub fn confirm(request_id: Uuid, operation: PeerOperation, status: ConfirmStatus) -> Self {
        Self {
            request_id,
            header: VersionHeader {
                version: PROTOCOL_VERSION,
                size: 0,
            },
            body: PeerBody::Confirm { operation, status },
        }
    }

    /// Returns the operation the message requests or confirms.
    #[must_use]
    pub fn operation(&self) -> PeerOperation {
        match &self.body {
            PeerBody::Request(request) => request.operation,
            PeerBody::Confirm { operation, .. } => *operation,
        }
    }

    /// Encodes the message to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> PeerResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a message from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> PeerResult<Self> {
        from_cbor(bytes)
    }
}

/// Bulk-transferred copy of a transaction's entry ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBackup {
    /// Raw transaction id.
    pub transaction_id: u64,
    /// Job the transaction belongs to.
    pub job_number: u64,
    /// Decided entry ids.
    pub entry_ids: EntryIdMap,
}

impl TransactionBackup {
    /// Encodes the backup to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> PeerResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a backup from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid backup.
    pub fn decode(bytes: &[u8]) -> PeerResult<Self> {
        from_cbor(bytes)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> PeerResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| PeerError::Codec(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> PeerResult<T> {
    ciborium::from_reader(bytes).map_err(|e| PeerError::Codec(e.to_string()))
}
