//! Core type definitions for DuplexDB.

use duplexdb_persist::SectorType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a configuration transaction.
///
/// Ids are monotonically increasing and never reused. Zero is reserved for
/// "no transaction".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The reserved invalid id.
    pub const INVALID: Self = Self(0);

    /// Creates a new transaction id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true unless this is [`TransactionId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier of a configured object in the array topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Creates a new object id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Number of the configuration job that owns a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobNumber(pub u64);

impl JobNumber {
    /// Creates a new job number.
    #[must_use]
    pub const fn new(job: u64) -> Self {
        Self(job)
    }

    /// Returns the raw job number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}", self.0)
    }
}

/// Why a transaction was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// A configuration job creating or changing objects.
    #[default]
    Create = 0,
    /// A transaction replayed during recovery.
    Recovery = 1,
}

impl TransactionType {
    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Create),
            1 => Some(Self::Recovery),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Lifecycle state of the transaction slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionState {
    /// No transaction.
    #[default]
    Inactive = 0,
    /// Entries may be staged.
    Active = 1,
    /// Entries are being applied.
    Commit = 2,
    /// Entries are being reverted.
    Rollback = 3,
}

impl TransactionState {
    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Inactive),
            1 => Some(Self::Active),
            2 => Some(Self::Commit),
            3 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Role of this controller in the pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControllerRole {
    /// Drives transactions and replicates them.
    #[default]
    Active = 0,
    /// Mirrors the peer's transactions.
    Passive = 1,
}

impl fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Passive => f.write_str("passive"),
        }
    }
}

/// Readiness of the configuration service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceState {
    /// Still loading; inbound replication is acknowledged and ignored.
    Initializing = 0,
    /// Serving requests.
    #[default]
    Ready = 1,
}

/// The four configuration tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TableKind {
    /// Object configurations.
    Object = 1,
    /// Per-object user records.
    User = 2,
    /// Object-to-object connections.
    Edge = 3,
    /// Array-wide settings.
    GlobalInfo = 4,
}

impl TableKind {
    /// All tables in commit order.
    pub const COMMIT_ORDER: [Self; 4] = [Self::GlobalInfo, Self::User, Self::Edge, Self::Object];

    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Object),
            2 => Some(Self::User),
            3 => Some(Self::Edge),
            4 => Some(Self::GlobalInfo),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the persistence sector holding this table.
    #[must_use]
    pub const fn sector(self) -> SectorType {
        match self {
            Self::Object => SectorType::Objects,
            Self::User => SectorType::Users,
            Self::Edge => SectorType::Edges,
            Self::GlobalInfo => SectorType::GlobalInfo,
        }
    }

    /// Returns a lowercase name for logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::User => "user",
            Self::Edge => "edge",
            Self::GlobalInfo => "global_info",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
