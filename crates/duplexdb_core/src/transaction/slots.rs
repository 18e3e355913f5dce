//! Fixed-capacity entry slots of a transaction.

use crate::entry::{Entry, EntryState, Persistable};
use crate::error::{DatabaseError, DatabaseResult};
use duplexdb_persist::EntryId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An entry staged into a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry<P> {
    /// The staged entry. For a destroy, the committed copy being destroyed.
    pub entry: Entry<P>,
    /// The committed value before the transaction, for modify and destroy.
    pub prior: Option<Entry<P>>,
}

/// Where an entry will be staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Slot index.
    pub index: usize,
    /// The entry folds into an entry already staged for the same key.
    pub merge: bool,
}

/// The slots of one table within a transaction.
///
/// Staging the same key twice folds a modify into the earlier create or
/// modify; every other repeat is rejected, so a table never holds two slots
/// with one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySlots<P> {
    slots: Vec<Option<StagedEntry<P>>>,
}

impl<P: Persistable> Default for EntrySlots<P> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<P: Persistable> EntrySlots<P> {
    /// Creates `capacity` empty slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Returns the entry in slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&StagedEntry<P>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut StagedEntry<P>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Iterates occupied slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &StagedEntry<P>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|staged| (index, staged)))
    }

    /// Returns the slot staging `key`.
    #[must_use]
    pub fn find(&self, key: &P::Key) -> Option<usize> {
        self.iter()
            .find(|(_, staged)| staged.entry.key() == *key)
            .map(|(index, _)| index)
    }

    /// Returns the first free slot.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if every slot is occupied.
    pub fn free_index(&self) -> DatabaseResult<usize> {
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or(DatabaseError::CapacityExceeded {
                table: P::TABLE,
                capacity: self.slots.len(),
            })
    }

    /// Decides where `entry` would be staged without changing anything.
    ///
    /// `committed` is the committed entry with the same key, if any.
    ///
    /// # Errors
    ///
    /// - `DuplicateKey` for a repeat that cannot fold, or a create of a committed key
    /// - `NotFound` for a modify or destroy of a key that is not committed
    /// - `CapacityExceeded` if a new slot is needed and none is free
    pub fn plan(&self, entry: &Entry<P>, committed: Option<&Entry<P>>) -> DatabaseResult<Placement> {
        let key = entry.key();
        let duplicate = || DatabaseError::DuplicateKey {
            table: P::TABLE,
            key: format!("{key:?}"),
        };

        if let Some(index) = self.find(&key) {
            let existing = self.get(index).map(|staged| staged.entry.state());
            return match (existing, entry.state()) {
                (Some(EntryState::Create | EntryState::Modify), EntryState::Modify) => {
                    Ok(Placement { index, merge: true })
                }
                _ => Err(duplicate()),
            };
        }

        match entry.state() {
            EntryState::Create if committed.is_some() => return Err(duplicate()),
            EntryState::Create => {}
            EntryState::Modify | EntryState::Destroy if committed.is_none() => {
                return Err(DatabaseError::not_found(format!(
                    "committed {} entry {key:?}",
                    P::TABLE
                )))
            }
            EntryState::Modify | EntryState::Destroy => {}
            state @ (EntryState::Invalid | EntryState::Valid) => {
                return Err(DatabaseError::invalid_entry(format!(
                    "cannot stage a {state} entry"
                )))
            }
        }

        Ok(Placement {
            index: self.free_index()?,
            merge: false,
        })
    }

    /// Stages `entry`.
    ///
    /// A create starts unplaced. A modify inherits the committed entry id and
    /// remembers the committed value. A destroy stages the committed copy
    /// itself.
    ///
    /// # Errors
    ///
    /// Same as [`plan`](Self::plan).
    pub fn stage(&mut self, mut entry: Entry<P>, committed: Option<Entry<P>>) -> DatabaseResult<Placement> {
        let placement = self.plan(&entry, committed.as_ref())?;
        entry.header.version_size = P::LAYOUT_SIZE;

        if placement.merge {
            let existing = self
                .get_mut(placement.index)
                .ok_or_else(|| DatabaseError::invalid_entry("merge target vanished"))?;
            existing.entry.payload = entry.payload;
            return Ok(placement);
        }

        let staged = match (entry.state(), committed) {
            (EntryState::Create, _) => {
                entry.header.entry_id = EntryId::UNPLACED;
                StagedEntry { entry, prior: None }
            }
            (EntryState::Modify, Some(committed)) => {
                entry.header.entry_id = committed.header.entry_id;
                StagedEntry {
                    entry,
                    prior: Some(committed),
                }
            }
            (EntryState::Destroy, Some(committed)) => StagedEntry {
                entry: committed.with_state(EntryState::Destroy),
                prior: Some(committed),
            },
            (state, _) => {
                return Err(DatabaseError::invalid_entry(format!(
                    "cannot stage a {state} entry"
                )))
            }
        };
        self.place(placement.index, staged);
        Ok(placement)
    }

    pub(crate) fn place(&mut self, index: usize, staged: StagedEntry<P>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(staged);
        }
    }

    pub(crate) fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Returns each slot's entry id, zero for empty or unplaced slots.
    #[must_use]
    pub fn entry_ids(&self) -> Vec<u64> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map_or(0, |s| s.entry.header.entry_id.as_u64()))
            .collect()
    }

    /// Copies decided entry ids into the matching slots. Zeros are ignored.
    pub(crate) fn adopt_entry_ids(&mut self, ids: &[u64]) {
        for (slot, id) in self.slots.iter_mut().zip(ids) {
            if let (Some(staged), true) = (slot.as_mut(), *id != 0) {
                staged.entry.header.entry_id = EntryId::new(*id);
            }
        }
    }

    /// Returns true if two occupied slots share a key.
    #[must_use]
    pub fn has_duplicate_keys(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.iter().any(|(_, staged)| !seen.insert(staged.entry.key()))
    }

    /// Returns how many slots hold an entry in `state`.
    #[must_use]
    pub fn count_in_state(&self, state: EntryState) -> usize {
        self.iter()
            .filter(|(_, staged)| staged.entry.state() == state)
            .count()
    }
}
