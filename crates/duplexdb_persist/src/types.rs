//! Identifiers and enums shared by the persistence logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a record in the general persistence log.
///
/// Entry id `0` means the record has not been durably placed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    /// The id carried by entries that were never written.
    pub const UNPLACED: Self = Self(0);

    /// Creates a new entry id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if the entry has a durable location.
    #[must_use]
    pub const fn is_placed(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Handle to an open log transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistHandle(pub u64);

impl PersistHandle {
    /// Creates a new handle.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PersistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// Region of the log a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SectorType {
    /// Object configuration records.
    Objects = 1,
    /// Per-object user records.
    Users = 2,
    /// Edge records.
    Edges = 3,
    /// Global configuration info.
    GlobalInfo = 4,
}

impl SectorType {
    /// All sectors in log order.
    pub const ALL: [Self; 4] = [Self::Objects, Self::Users, Self::Edges, Self::GlobalInfo];

    /// Converts a byte to a sector type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Objects),
            2 => Some(Self::Users),
            3 => Some(Self::Edges),
            4 => Some(Self::GlobalInfo),
            _ => None,
        }
    }

    /// Converts the sector type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Objects => "objects",
            Self::Users => "users",
            Self::Edges => "edges",
            Self::GlobalInfo => "global-info",
        };
        f.write_str(name)
    }
}

/// What the log's crash replay found about the most recent transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayOutcome {
    /// The most recent transaction reached its commit point.
    Committed,
    /// The most recent transaction was aborted or never committed.
    NotCommitted,
    /// The log cannot tell.
    Unknown,
}

/// Operation applied to a system-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemOp {
    /// Write a new record.
    Create,
    /// Overwrite an existing record.
    Update,
    /// Remove a record.
    Delete,
}

/// Fixed location of a system object's record.
///
/// System records are addressed by what they describe rather than by an
/// allocated id, so both controllers agree on placement without asking the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemKey {
    /// Sector of the record.
    pub sector: SectorType,
    /// Owning object id.
    pub object_id: u32,
    /// Index within the object (edge index, zero otherwise).
    pub index: u16,
}

impl SystemKey {
    /// Creates a new system key.
    #[must_use]
    pub const fn new(sector: SectorType, object_id: u32, index: u16) -> Self {
        Self {
            sector,
            object_id,
            index,
        }
    }

    /// Returns the entry id a system record always occupies.
    ///
    /// Never zero because the sector byte is at least 1.
    #[must_use]
    pub const fn entry_id(self) -> EntryId {
        EntryId(
            ((self.sector as u64) << 48) | ((self.object_id as u64) << 16) | self.index as u64,
        )
    }
}

impl fmt::Display for SystemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sys:{}/{}/{}", self.sector, self.object_id, self.index)
    }
}
