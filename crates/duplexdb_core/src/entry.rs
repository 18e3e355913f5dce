//! Configuration entries.
//!
//! All four entry kinds share an [`EntryHeader`] and differ only in payload.
//! [`Persistable`] ties a payload type to its table, its key, its routing
//! between the two logs, and its effect on the live topology.

use crate::error::DatabaseResult;
use crate::table::{EntryTables, Table};
use crate::topology::Topology;
use crate::transaction::{EntrySlots, Transaction};
use crate::types::{ObjectId, TableKind};
use duplexdb_persist::{EntryId, SystemKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryState {
    /// Unused, or reverted by a rollback.
    #[default]
    Invalid = 0,
    /// Committed.
    Valid = 1,
    /// Staged creation.
    Create = 2,
    /// Staged modification.
    Modify = 3,
    /// Staged destruction.
    Destroy = 4,
}

impl EntryState {
    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Invalid),
            1 => Some(Self::Valid),
            2 => Some(Self::Create),
            3 => Some(Self::Modify),
            4 => Some(Self::Destroy),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for states a commit or rollback walk acts on.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Create | Self::Modify | Self::Destroy)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "INVALID",
            Self::Valid => "VALID",
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::Destroy => "DESTROY",
        };
        f.write_str(name)
    }
}

/// Header shared by every entry kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Lifecycle state.
    pub state: EntryState,
    /// Durable location; [`EntryId::UNPLACED`] until first written.
    pub entry_id: EntryId,
    /// Owning object. For edges, the client object.
    pub object_id: ObjectId,
    /// Layout size of the payload version that wrote the entry.
    pub version_size: u32,
}

/// A header plus its table-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<P> {
    /// Shared header.
    pub header: EntryHeader,
    /// Table-specific payload.
    pub payload: P,
}

impl<P: Persistable> Entry<P> {
    fn with(state: EntryState, object_id: ObjectId, payload: P) -> Self {
        Self {
            header: EntryHeader {
                state,
                entry_id: EntryId::UNPLACED,
                object_id,
                version_size: P::LAYOUT_SIZE,
            },
            payload,
        }
    }

    /// Creates an entry staging a creation.
    #[must_use]
    pub fn create(object_id: ObjectId, payload: P) -> Self {
        Self::with(EntryState::Create, object_id, payload)
    }

    /// Creates an entry staging a modification.
    #[must_use]
    pub fn modify(object_id: ObjectId, payload: P) -> Self {
        Self::with(EntryState::Modify, object_id, payload)
    }

    /// Creates an entry staging a destruction.
    ///
    /// Only the key fields of `payload` matter; staging replaces the payload
    /// with the committed copy.
    #[must_use]
    pub fn destroy(object_id: ObjectId, payload: P) -> Self {
        Self::with(EntryState::Destroy, object_id, payload)
    }

    /// Creates a committed entry, as loaded at boot.
    #[must_use]
    pub fn valid(object_id: ObjectId, entry_id: EntryId, payload: P) -> Self {
        let mut entry = Self::with(EntryState::Valid, object_id, payload);
        entry.header.entry_id = entry_id;
        entry
    }

    /// Returns the entry's table key.
    #[must_use]
    pub fn key(&self) -> P::Key {
        P::key(&self.header, &self.payload)
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> EntryState {
        self.header.state
    }

    /// Returns the durable location.
    #[must_use]
    pub fn entry_id(&self) -> EntryId {
        self.header.entry_id
    }

    /// Returns the fixed system-log location for this entry.
    #[must_use]
    pub fn system_key(&self) -> SystemKey {
        SystemKey::new(
            P::TABLE.sector(),
            self.header.object_id.as_u32(),
            P::system_index(&self.payload),
        )
    }

    /// Returns a copy with `state`.
    #[must_use]
    pub(crate) fn with_state(&self, state: EntryState) -> Self {
        let mut entry = self.clone();
        entry.header.state = state;
        entry
    }
}

/// What a live-topology effect did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// The topology changed.
    Applied,
    /// The object the effect targets does not exist.
    Missing,
    /// The table has no live counterpart.
    Untouched,
}

/// A payload type stored in one of the four configuration tables.
///
/// The associated key identifies an entry within its table; two entries
/// with the same key never coexist in a transaction or a committed table.
pub trait Persistable:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Table key.
    type Key: Ord + Clone + fmt::Debug + Send + Sync;

    /// The table this payload lives in.
    const TABLE: TableKind;

    /// Layout size recorded in `version_size`.
    const LAYOUT_SIZE: u32;

    /// Derives the key of an entry.
    fn key(header: &EntryHeader, payload: &Self) -> Self::Key;

    /// Object id deciding between the system and general logs.
    ///
    /// `None` routes to the general log unconditionally.
    fn routing_id(header: &EntryHeader) -> Option<ObjectId> {
        Some(header.object_id)
    }

    /// Index of the entry under its object in the system log.
    fn system_index(_payload: &Self) -> u16 {
        0
    }

    /// Returns this payload's committed table.
    fn committed(tables: &EntryTables) -> &Table<Self>;

    /// Returns this payload's slots in a transaction.
    fn slots(txn: &Transaction) -> &EntrySlots<Self>;

    /// Returns this payload's slots in a transaction, mutably.
    fn slots_mut(txn: &mut Transaction) -> &mut EntrySlots<Self>;

    /// Applies the live effect of staging `entry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology refuses the change.
    fn stage_live(_entry: &Entry<Self>, _topology: &dyn Topology) -> DatabaseResult<()> {
        Ok(())
    }

    /// Tears down the live effect of a staged creation.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology refuses the change.
    fn discard_live(_entry: &Entry<Self>, _topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        Ok(LiveOutcome::Untouched)
    }

    /// Brings the live side back to `saved`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology refuses the change.
    fn restore_live(_saved: &Entry<Self>, _topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        Ok(LiveOutcome::Untouched)
    }
}

/// Configuration of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Class tag.
    pub class_id: u32,
    /// Opaque class-specific configuration.
    pub config: Vec<u8>,
}

impl Persistable for ObjectConfig {
    type Key = ObjectId;
    const TABLE: TableKind = TableKind::Object;
    const LAYOUT_SIZE: u32 = 256;

    fn key(header: &EntryHeader, _payload: &Self) -> ObjectId {
        header.object_id
    }

    fn committed(tables: &EntryTables) -> &Table<Self> {
        tables.objects()
    }

    fn slots(txn: &Transaction) -> &EntrySlots<Self> {
        &txn.objects
    }

    fn slots_mut(txn: &mut Transaction) -> &mut EntrySlots<Self> {
        &mut txn.objects
    }

    fn stage_live(entry: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<()> {
        let id = entry.header.object_id;
        match entry.header.state {
            EntryState::Create => {
                topology.create_object(id, entry.payload.class_id, &entry.payload.config)
            }
            EntryState::Modify => topology.reconfigure_object(id, &entry.payload.config),
            EntryState::Destroy => topology.destroy_object(id),
            EntryState::Invalid | EntryState::Valid => Ok(()),
        }
    }

    fn discard_live(entry: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        let id = entry.header.object_id;
        if !topology.object_exists(id) {
            return Ok(LiveOutcome::Missing);
        }
        topology.destroy_object(id)?;
        Ok(LiveOutcome::Applied)
    }

    fn restore_live(saved: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        let id = saved.header.object_id;
        if topology.object_exists(id) {
            topology.reconfigure_object(id, &saved.payload.config)?;
        } else {
            topology.create_object(id, saved.payload.class_id, &saved.payload.config)?;
        }
        Ok(LiveOutcome::Applied)
    }
}

/// A user record attached to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Class tag of the record.
    pub class_id: u32,
    /// Opaque record contents.
    pub data: Vec<u8>,
}

impl Persistable for UserRecord {
    type Key = ObjectId;
    const TABLE: TableKind = TableKind::User;
    const LAYOUT_SIZE: u32 = 128;

    fn key(header: &EntryHeader, _payload: &Self) -> ObjectId {
        header.object_id
    }

    fn committed(tables: &EntryTables) -> &Table<Self> {
        tables.users()
    }

    fn slots(txn: &Transaction) -> &EntrySlots<Self> {
        &txn.users
    }

    fn slots_mut(txn: &mut Transaction) -> &mut EntrySlots<Self> {
        &mut txn.users
    }
}

/// A connection from a client object to a server object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeLink {
    /// Position of the edge on the client.
    pub client_index: u16,
    /// Object the client consumes.
    pub server_id: ObjectId,
    /// Blocks of the server the edge covers.
    pub capacity: u64,
    /// First block of the server the edge covers.
    pub offset: u64,
}

impl Persistable for EdgeLink {
    type Key = (ObjectId, u16);
    const TABLE: TableKind = TableKind::Edge;
    const LAYOUT_SIZE: u32 = 40;

    fn key(header: &EntryHeader, payload: &Self) -> (ObjectId, u16) {
        (header.object_id, payload.client_index)
    }

    fn system_index(payload: &Self) -> u16 {
        payload.client_index
    }

    fn committed(tables: &EntryTables) -> &Table<Self> {
        tables.edges()
    }

    fn slots(txn: &Transaction) -> &EntrySlots<Self> {
        &txn.edges
    }

    fn slots_mut(txn: &mut Transaction) -> &mut EntrySlots<Self> {
        &mut txn.edges
    }

    fn stage_live(entry: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<()> {
        let client = entry.header.object_id;
        let link = &entry.payload;
        match entry.header.state {
            EntryState::Create => topology.connect_edge(client, link.client_index, link.server_id),
            EntryState::Modify => {
                topology.disconnect_edge(client, link.client_index)?;
                topology.connect_edge(client, link.client_index, link.server_id)
            }
            EntryState::Destroy => topology.disconnect_edge(client, link.client_index),
            EntryState::Invalid | EntryState::Valid => Ok(()),
        }
    }

    fn discard_live(entry: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        let client = entry.header.object_id;
        if !topology.object_exists(client) {
            return Ok(LiveOutcome::Missing);
        }
        topology.disconnect_edge(client, entry.payload.client_index)?;
        Ok(LiveOutcome::Applied)
    }

    fn restore_live(saved: &Entry<Self>, topology: &dyn Topology) -> DatabaseResult<LiveOutcome> {
        let client = saved.header.object_id;
        let link = &saved.payload;
        topology.disconnect_edge(client, link.client_index)?;
        topology.connect_edge(client, link.client_index, link.server_id)?;
        Ok(LiveOutcome::Applied)
    }
}

/// Kind of array-wide setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GlobalInfoType {
    /// Hot-spare policy.
    #[default]
    Spare,
    /// Configuration generation counter.
    Generation,
    /// Time thresholds.
    TimeThreshold,
    /// Power-saving policy.
    PowerSave,
    /// Encryption mode.
    Encryption,
}

/// One array-wide setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalInfo {
    /// Which setting this is.
    pub info_type: GlobalInfoType,
    /// Opaque setting value.
    pub data: Vec<u8>,
}

impl GlobalInfo {
    /// Creates a generation setting holding `value`.
    #[must_use]
    pub fn generation(value: u64) -> Self {
        Self {
            info_type: GlobalInfoType::Generation,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Returns the counter of a generation setting.
    #[must_use]
    pub fn generation_value(&self) -> Option<u64> {
        if self.info_type != GlobalInfoType::Generation {
            return None;
        }
        let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }
}

impl Persistable for GlobalInfo {
    type Key = GlobalInfoType;
    const TABLE: TableKind = TableKind::GlobalInfo;
    const LAYOUT_SIZE: u32 = 64;

    fn key(_header: &EntryHeader, payload: &Self) -> GlobalInfoType {
        payload.info_type
    }

    fn routing_id(_header: &EntryHeader) -> Option<ObjectId> {
        None
    }

    fn committed(tables: &EntryTables) -> &Table<Self> {
        tables.global_infos()
    }

    fn slots(txn: &Transaction) -> &EntrySlots<Self> {
        &txn.global_infos
    }

    fn slots_mut(txn: &mut Transaction) -> &mut EntrySlots<Self> {
        &mut txn.global_infos
    }
}

/// An object entry.
pub type ObjectEntry = Entry<ObjectConfig>;
/// A user entry.
pub type UserEntry = Entry<UserRecord>;
/// An edge entry.
pub type EdgeEntry = Entry<EdgeLink>;
/// A global-info entry.
pub type GlobalInfoEntry = Entry<GlobalInfo>;

/// An entry of any table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableEntry {
    /// Object table.
    Object(ObjectEntry),
    /// User table.
    User(UserEntry),
    /// Edge table.
    Edge(EdgeEntry),
    /// Global-info table.
    GlobalInfo(GlobalInfoEntry),
}

impl TableEntry {
    /// Returns the table the entry belongs to.
    #[must_use]
    pub fn table(&self) -> TableKind {
        match self {
            Self::Object(_) => TableKind::Object,
            Self::User(_) => TableKind::User,
            Self::Edge(_) => TableKind::Edge,
            Self::GlobalInfo(_) => TableKind::GlobalInfo,
        }
    }
}
