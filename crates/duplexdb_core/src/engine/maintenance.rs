//! Helpers around the transaction lifecycle.

use super::Engine;
use crate::entry::{Entry, EntryState, GlobalInfo, GlobalInfoType, Persistable, TableEntry};
use crate::error::{DatabaseError, DatabaseResult};
use crate::table::EntryTables;
use crate::transaction::apply::{persist_upsert, ApplyContext};
use crate::types::{ObjectId, TransactionId, TransactionState};
use duplexdb_persist::EntryId;
use tracing::{debug, info};

impl Engine {
    /// Blocks until no transaction is in flight.
    pub fn transaction_destroy(&self) {
        debug!(txn = %self.current_id(), "waiting for the transaction slot to drain");
        self.manager.wait_inactive(self.config.destroy_poll_interval);
    }

    /// Returns true if `id` names the in-flight transaction.
    #[must_use]
    pub fn is_valid_id(&self, id: TransactionId) -> bool {
        id.is_valid() && self.state() != TransactionState::Inactive && self.current_id() == id
    }

    /// Counts the object creations of `class_id` staged in the in-flight
    /// transaction.
    #[must_use]
    pub fn count_created_objects(&self, class_id: u32) -> usize {
        self.manager
            .snapshot()
            .map_or(0, |txn| txn.count_created_objects(class_id))
    }

    /// Stages the next configuration generation and returns it.
    ///
    /// The counter is read from the in-flight transaction if it already
    /// stages one, else from the committed table, else starts from zero.
    ///
    /// # Errors
    ///
    /// See [`stage_entry`](Self::stage_entry).
    pub fn next_generation_id(&self) -> DatabaseResult<u64> {
        let key = GlobalInfoType::Generation;
        let staged = self.manager.snapshot().and_then(|txn| {
            let slots = txn.global_infos();
            slots
                .find(&key)
                .and_then(|index| slots.get(index))
                .map(|staged| staged.entry.clone())
        });
        let committed = self.tables.global_infos().get(&key);

        let current = staged
            .as_ref()
            .or(committed.as_ref())
            .and_then(|entry| entry.payload.generation_value())
            .unwrap_or(0);
        let next = current
            .checked_add(1)
            .ok_or_else(|| DatabaseError::invalid_entry("generation counter exhausted"))?;

        let payload = GlobalInfo::generation(next);
        let entry = if staged.is_some() || committed.is_some() {
            Entry::modify(ObjectId::default(), payload)
        } else {
            Entry::create(ObjectId::default(), payload)
        };
        self.add_global_info_entry(entry)?;
        debug!(generation = next, "generation staged");
        Ok(next)
    }

    /// Persists committed entries outside any transaction.
    ///
    /// Each entry is written to the log that owns it and stored in its
    /// committed table. Returns the entry ids in input order.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a log cannot be opened, a persist error if a write
    /// fails, or `Timeout` if the general log does not commit within the
    /// auxiliary timeout. Nothing is stored in memory on error.
    pub fn persist_entries_without_transaction(
        &self,
        entries: &[TableEntry],
    ) -> DatabaseResult<Vec<EntryId>> {
        let mut session = self.open_session()?;
        let ids = {
            let ctx = ApplyContext {
                tables: &self.tables,
                topology: &*self.topology,
                session: Some(&session),
                last_system_object_id: self.config.last_system_object_id,
                transaction_id: TransactionId::INVALID,
            };
            entries
                .iter()
                .map(|entry| match entry {
                    TableEntry::Object(e) => persist_valid(e, &ctx),
                    TableEntry::User(e) => persist_valid(e, &ctx),
                    TableEntry::Edge(e) => persist_valid(e, &ctx),
                    TableEntry::GlobalInfo(e) => persist_valid(e, &ctx),
                })
                .collect::<DatabaseResult<Vec<_>>>()?
        };
        session.commit_general_within(self.config.auxiliary_persist_timeout)?;
        session.commit_system()?;
        drop(session);

        for (entry, id) in entries.iter().zip(&ids) {
            match entry {
                TableEntry::Object(e) => store(&self.tables, e, *id)?,
                TableEntry::User(e) => store(&self.tables, e, *id)?,
                TableEntry::Edge(e) => store(&self.tables, e, *id)?,
                TableEntry::GlobalInfo(e) => store(&self.tables, e, *id)?,
            }
        }
        info!(count = ids.len(), "entries persisted without a transaction");
        Ok(ids)
    }
}

fn persist_valid<P: Persistable>(entry: &Entry<P>, ctx: &ApplyContext<'_>) -> DatabaseResult<EntryId> {
    let image = entry.with_state(EntryState::Valid);
    let create = !image.entry_id().is_placed();
    persist_upsert(&image, create, ctx).map(|(id, _)| id)
}

fn store<P: Persistable>(tables: &EntryTables, entry: &Entry<P>, id: EntryId) -> DatabaseResult<()> {
    let mut image = entry.with_state(EntryState::Valid);
    image.header.entry_id = id;
    P::committed(tables).insert_valid(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineBuilder;
    use crate::entry::{ObjectConfig, UserRecord};
    use crate::transaction::TransactionInfo;
    use crate::types::JobNumber;
    use duplexdb_persist::{InMemoryPersistLog, InMemorySystemLog, PersistLog, SystemLog};
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(class_id: u32) -> ObjectConfig {
        ObjectConfig {
            class_id,
            config: Vec::new(),
        }
    }

    #[test]
    fn valid_id_tracks_the_slot() {
        let engine = EngineBuilder::new(EngineConfig::default()).build();
        assert!(!engine.is_valid_id(TransactionId::INVALID));
        let id = engine.start(TransactionInfo::new(JobNumber(1))).unwrap();
        assert!(engine.is_valid_id(id));
        assert!(!engine.is_valid_id(TransactionId(id.as_u64() + 1)));
        engine.commit().unwrap();
        assert!(!engine.is_valid_id(id));
    }

    #[test]
    fn counts_creates_by_class() {
        let engine = EngineBuilder::new(EngineConfig::default()).build();
        assert_eq!(engine.count_created_objects(1), 0);
        engine.start(TransactionInfo::new(JobNumber(1))).unwrap();
        engine.add_object_entry(Entry::create(ObjectId(100), pool(1))).unwrap();
        engine.add_object_entry(Entry::create(ObjectId(101), pool(1))).unwrap();
        engine.add_object_entry(Entry::create(ObjectId(102), pool(2))).unwrap();
        assert_eq!(engine.count_created_objects(1), 2);
        assert_eq!(engine.count_created_objects(2), 1);
        assert_eq!(engine.count_created_objects(3), 0);
    }

    #[test]
    fn generation_counts_up_across_transactions() {
        let engine = EngineBuilder::new(EngineConfig::default()).build();
        engine.start(TransactionInfo::new(JobNumber(1))).unwrap();
        assert_eq!(engine.next_generation_id().unwrap(), 1);
        assert_eq!(engine.next_generation_id().unwrap(), 2);
        assert_eq!(engine.snapshot().unwrap().global_infos().occupied(), 1);
        engine.commit().unwrap();

        engine.start(TransactionInfo::new(JobNumber(2))).unwrap();
        assert_eq!(engine.next_generation_id().unwrap(), 3);
        engine.commit().unwrap();
        let committed = engine
            .tables()
            .global_infos()
            .get(&GlobalInfoType::Generation)
            .unwrap();
        assert_eq!(committed.payload.generation_value(), Some(3));
    }

    #[test]
    fn generation_requires_active_transaction() {
        let engine = EngineBuilder::new(EngineConfig::default()).build();
        assert!(matches!(
            engine.next_generation_id(),
            Err(DatabaseError::InvalidState { .. })
        ));
    }

    #[test]
    fn persists_without_transaction() {
        let persist = Arc::new(InMemoryPersistLog::new());
        let system = Arc::new(InMemorySystemLog::new());
        let engine = EngineBuilder::new(EngineConfig::default())
            .with_persist_log(Arc::clone(&persist) as Arc<dyn PersistLog>)
            .with_system_log(Arc::clone(&system) as Arc<dyn SystemLog>)
            .build();
        let user = Entry::create(
            ObjectId(3),
            UserRecord {
                class_id: 2,
                data: b"admin".to_vec(),
            },
        );
        let object = Entry::create(ObjectId(100), pool(1));

        let ids = engine
            .persist_entries_without_transaction(&[
                TableEntry::User(user.clone()),
                TableEntry::Object(object),
            ])
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.is_placed()));
        assert_eq!(engine.state(), TransactionState::Inactive);
        assert_eq!(persist.len(), 1);
        assert!(system.read(user.system_key()).unwrap().is_some());
        let stored = engine.tables().objects().get(&ObjectId(100)).unwrap();
        assert_eq!(stored.state(), EntryState::Valid);
        assert_eq!(stored.entry_id(), ids[1]);
    }

    #[test]
    fn destroy_waits_for_slot_to_drain() {
        let config = EngineConfig::default().destroy_poll_interval(Duration::from_millis(2));
        let engine = EngineBuilder::new(config).build();
        engine.start(TransactionInfo::new(JobNumber(1))).unwrap();
        let aborter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                engine.abort().unwrap();
            })
        };
        engine.transaction_destroy();
        assert_eq!(engine.state(), TransactionState::Inactive);
        aborter.join().unwrap();
    }
}
