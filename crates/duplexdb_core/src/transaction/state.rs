//! Transaction state.

use crate::config::SlotLimits;
use crate::entry::{EdgeLink, EntryState, GlobalInfo, ObjectConfig, Persistable, UserRecord};
use crate::error::{DatabaseError, DatabaseResult};
use crate::transaction::slots::EntrySlots;
use crate::types::{JobNumber, TransactionId, TransactionState, TransactionType};
use duplexdb_peer::{EntryIdMap, TransactionSummary};
use serde::{Deserialize, Serialize};

/// What a caller supplies to start a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Why the transaction is opened.
    pub transaction_type: TransactionType,
    /// Owning job.
    pub job_number: JobNumber,
}

impl TransactionInfo {
    /// Creates info for a configuration job.
    #[must_use]
    pub const fn new(job_number: JobNumber) -> Self {
        Self {
            transaction_type: TransactionType::Create,
            job_number,
        }
    }

    /// Sets the transaction type.
    #[must_use]
    pub const fn transaction_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = transaction_type;
        self
    }
}

/// The in-flight configuration transaction.
///
/// Holds one fixed-capacity slot array per table. Entries can only be staged
/// while the transaction is [`TransactionState::Active`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    info: TransactionInfo,
    pub(crate) objects: EntrySlots<ObjectConfig>,
    pub(crate) users: EntrySlots<UserRecord>,
    pub(crate) edges: EntrySlots<EdgeLink>,
    pub(crate) global_infos: EntrySlots<GlobalInfo>,
}

impl Transaction {
    /// Creates an active transaction.
    #[must_use]
    pub fn new(id: TransactionId, info: TransactionInfo, limits: SlotLimits) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            info,
            objects: EntrySlots::with_capacity(limits.objects),
            users: EntrySlots::with_capacity(limits.users),
            edges: EntrySlots::with_capacity(limits.edges),
            global_infos: EntrySlots::with_capacity(limits.global_infos),
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Returns the start info.
    #[must_use]
    pub fn info(&self) -> TransactionInfo {
        self.info
    }

    /// Returns the owning job.
    #[must_use]
    pub fn job_number(&self) -> JobNumber {
        self.info.job_number
    }

    /// Returns the object slots.
    #[must_use]
    pub fn objects(&self) -> &EntrySlots<ObjectConfig> {
        &self.objects
    }

    /// Returns the user slots.
    #[must_use]
    pub fn users(&self) -> &EntrySlots<UserRecord> {
        &self.users
    }

    /// Returns the edge slots.
    #[must_use]
    pub fn edges(&self) -> &EntrySlots<EdgeLink> {
        &self.edges
    }

    /// Returns the global-info slots.
    #[must_use]
    pub fn global_infos(&self) -> &EntrySlots<GlobalInfo> {
        &self.global_infos
    }

    /// Returns the slots holding `P`.
    #[must_use]
    pub fn slots<P: Persistable>(&self) -> &EntrySlots<P> {
        P::slots(self)
    }

    /// Ensures entries may be staged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the transaction is active.
    pub fn ensure_active(&self) -> DatabaseResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(DatabaseError::invalid_state(
                &[TransactionState::Active],
                self.state,
            ))
        }
    }

    /// Returns the number of occupied slots across all tables.
    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.objects.occupied()
            + self.users.occupied()
            + self.edges.occupied()
            + self.global_infos.occupied()
    }

    /// Returns the number of staged object creations of `class_id`.
    #[must_use]
    pub fn count_created_objects(&self, class_id: u32) -> usize {
        self.objects
            .iter()
            .filter(|(_, staged)| {
                staged.entry.state() == EntryState::Create && staged.entry.payload.class_id == class_id
            })
            .count()
    }

    /// Returns true if any table holds two slots with one key.
    #[must_use]
    pub fn has_duplicate_keys(&self) -> bool {
        self.objects.has_duplicate_keys()
            || self.users.has_duplicate_keys()
            || self.edges.has_duplicate_keys()
            || self.global_infos.has_duplicate_keys()
    }

    /// Returns the entry ids decided so far, by table and slot.
    #[must_use]
    pub fn entry_id_map(&self) -> EntryIdMap {
        EntryIdMap {
            objects: self.objects.entry_ids(),
            users: self.users.entry_ids(),
            edges: self.edges.entry_ids(),
            global_infos: self.global_infos.entry_ids(),
        }
    }

    pub(crate) fn adopt_entry_ids(&mut self, ids: &EntryIdMap) {
        self.objects.adopt_entry_ids(&ids.objects);
        self.users.adopt_entry_ids(&ids.users);
        self.edges.adopt_entry_ids(&ids.edges);
        self.global_infos.adopt_entry_ids(&ids.global_infos);
    }

    /// Returns the fields replicated to the peer.
    #[must_use]
    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            transaction_id: self.id.as_u64(),
            state: self.state.as_byte(),
            transaction_type: self.info.transaction_type.as_byte(),
            job_number: self.info.job_number.as_u64(),
            entry_ids: self.entry_id_map(),
        }
    }
}
