//! Committed entry tables.

use crate::config::EngineConfig;
use crate::entry::{EdgeLink, Entry, EntryState, GlobalInfo, ObjectConfig, Persistable, UserRecord};
use crate::error::{DatabaseError, DatabaseResult};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;

/// A fixed-capacity table of committed entries.
///
/// Each table has its own lock; a commit or rollback walk holds it for the
/// duration of that table's pass.
pub struct Table<P: Persistable> {
    entries: Mutex<BTreeMap<P::Key, Entry<P>>>,
    capacity: usize,
}

impl<P: Persistable> Table<P> {
    /// Creates an empty table.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Locks the table.
    pub fn lock(&self) -> TableGuard<'_, P> {
        TableGuard {
            entries: self.entries.lock(),
            capacity: self.capacity,
        }
    }

    /// Returns a copy of the entry with `key`.
    #[must_use]
    pub fn get(&self, key: &P::Key) -> Option<Entry<P>> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns true if an entry with `key` is committed.
    #[must_use]
    pub fn contains(&self, key: &P::Key) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Returns a copy of every entry in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry<P>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Inserts a committed entry directly, as done when loading at boot.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the table is full.
    pub fn insert_valid(&self, entry: Entry<P>) -> DatabaseResult<()> {
        self.lock().upsert(entry.with_state(EntryState::Valid))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<P: Persistable> fmt::Debug for Table<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("table", &P::TABLE)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Exclusive access to a [`Table`].
pub struct TableGuard<'a, P: Persistable> {
    entries: MutexGuard<'a, BTreeMap<P::Key, Entry<P>>>,
    capacity: usize,
}

impl<P: Persistable> TableGuard<'_, P> {
    /// Returns the entry with `key`.
    #[must_use]
    pub fn get(&self, key: &P::Key) -> Option<&Entry<P>> {
        self.entries.get(key)
    }

    /// Inserts or replaces the entry under its key.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the key is new and the table is full.
    pub fn upsert(&mut self, entry: Entry<P>) -> DatabaseResult<()> {
        let key = entry.key();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            return Err(DatabaseError::CapacityExceeded {
                table: P::TABLE,
                capacity: self.capacity,
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Removes the entry with `key`.
    pub fn remove(&mut self, key: &P::Key) -> Option<Entry<P>> {
        self.entries.remove(key)
    }
}

/// The four committed configuration tables.
#[derive(Debug)]
pub struct EntryTables {
    objects: Table<ObjectConfig>,
    users: Table<UserRecord>,
    edges: Table<EdgeLink>,
    global_infos: Table<GlobalInfo>,
}

impl EntryTables {
    /// Creates empty tables sized by `config`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            objects: Table::new(config.table_capacity),
            users: Table::new(config.table_capacity),
            edges: Table::new(config.table_capacity),
            global_infos: Table::new(config.table_capacity),
        }
    }

    /// Returns the object table.
    #[must_use]
    pub fn objects(&self) -> &Table<ObjectConfig> {
        &self.objects
    }

    /// Returns the user table.
    #[must_use]
    pub fn users(&self) -> &Table<UserRecord> {
        &self.users
    }

    /// Returns the edge table.
    #[must_use]
    pub fn edges(&self) -> &Table<EdgeLink> {
        &self.edges
    }

    /// Returns the global-info table.
    #[must_use]
    pub fn global_infos(&self) -> &Table<GlobalInfo> {
        &self.global_infos
    }

    /// Returns the table holding `P`.
    #[must_use]
    pub fn table<P: Persistable>(&self) -> &Table<P> {
        P::committed(self)
    }

    /// Returns the total number of committed entries.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.objects.len() + self.users.len() + self.edges.len() + self.global_infos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;
    use duplexdb_persist::EntryId;

    fn object(id: u32) -> Entry<ObjectConfig> {
        Entry::valid(ObjectId(id), EntryId::new(u64::from(id)), ObjectConfig::default())
    }

    #[test]
    fn upsert_replaces_same_key() {
        let table = Table::<ObjectConfig>::new(2);
        table.insert_valid(object(1)).unwrap();
        let mut replacement = object(1);
        replacement.payload.class_id = 4;
        table.insert_valid(replacement).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&ObjectId(1)).unwrap().payload.class_id, 4);
    }

    #[test]
    fn full_table_rejects_new_keys() {
        let table = Table::<ObjectConfig>::new(1);
        table.insert_valid(object(1)).unwrap();
        assert!(matches!(
            table.insert_valid(object(2)),
            Err(DatabaseError::CapacityExceeded { capacity: 1, .. })
        ));
        table.insert_valid(object(1)).unwrap();
    }

    #[test]
    fn insert_valid_forces_valid_state() {
        let table = Table::<ObjectConfig>::new(4);
        table
            .insert_valid(Entry::create(ObjectId(3), ObjectConfig::default()))
            .unwrap();
        assert_eq!(table.get(&ObjectId(3)).unwrap().state(), EntryState::Valid);
    }

    #[test]
    fn guard_remove() {
        let tables = EntryTables::new(&EngineConfig::default());
        tables.objects().insert_valid(object(5)).unwrap();
        let removed = tables.table::<ObjectConfig>().lock().remove(&ObjectId(5));
        assert!(removed.is_some());
        assert!(tables.objects().is_empty());
        assert_eq!(tables.total_len(), 0);
    }
}
