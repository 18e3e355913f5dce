//! Applying staged entries to the committed tables and the logs.
//!
//! A commit walks Global-Info, User, Edge, Object; a rollback walks the
//! reverse, and within a table visits slots last to first. Every walk holds
//! each table's lock for the duration of that table's pass.
//!
//! Without a [`LogSession`] a walk only touches memory: the passive
//! controller folds a commit this way, and an abort reverts this way.

use crate::codec::{from_cbor, to_cbor};
use crate::entry::{Entry, EntryState, LiveOutcome, Persistable};
use crate::entry::{EdgeLink, GlobalInfo, ObjectConfig, UserRecord};
use crate::error::{DatabaseError, DatabaseResult};
use crate::table::{EntryTables, TableGuard};
use crate::topology::Topology;
use crate::transaction::session::LogSession;
use crate::transaction::slots::StagedEntry;
use crate::transaction::state::Transaction;
use crate::types::{ObjectId, TransactionId};
use duplexdb_persist::{EntryId, SystemOp};
use tracing::{debug, warn};

/// Which way a walk moves entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Apply staged entries.
    Commit,
    /// Revert staged entries.
    Rollback,
}

/// What applying one entry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The entry was not pending.
    Skipped,
    /// A new durable record was written.
    Written(EntryId),
    /// An existing durable record was overwritten.
    Modified(EntryId),
    /// The committed entry was updated in memory only.
    Folded,
    /// The entry was removed from the table and the log.
    Deleted,
    /// The entry was reverted.
    Reverted,
    /// A create was reverted but its live object never existed.
    Tolerated,
    /// The entry could not be applied; the table was left alone.
    Failed,
}

/// Tally of a walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkReport {
    /// Entries applied.
    pub applied: usize,
    /// Entries applied with a tolerated fault.
    pub tolerated: usize,
    /// Entries that failed.
    pub failed: usize,
}

impl WalkReport {
    fn record(&mut self, effect: Effect) {
        match effect {
            Effect::Skipped => {}
            Effect::Tolerated => self.tolerated += 1,
            Effect::Failed => self.failed += 1,
            _ => self.applied += 1,
        }
    }
}

/// Everything a walk touches besides the transaction.
pub(crate) struct ApplyContext<'a> {
    pub tables: &'a EntryTables,
    pub topology: &'a dyn Topology,
    pub session: Option<&'a LogSession<'a>>,
    pub last_system_object_id: ObjectId,
    pub transaction_id: TransactionId,
}

impl ApplyContext<'_> {
    fn routes_to_system<P: Persistable>(&self, entry: &Entry<P>) -> bool {
        P::routing_id(&entry.header).is_some_and(|id| id <= self.last_system_object_id)
    }
}

/// Walks every table of `txn` in `direction`.
pub(crate) fn walk(txn: &mut Transaction, direction: Direction, ctx: &ApplyContext<'_>) -> WalkReport {
    let mut report = WalkReport::default();
    match direction {
        Direction::Commit => {
            apply_table::<GlobalInfo>(txn, direction, ctx, &mut report);
            apply_table::<UserRecord>(txn, direction, ctx, &mut report);
            apply_table::<EdgeLink>(txn, direction, ctx, &mut report);
            apply_table::<ObjectConfig>(txn, direction, ctx, &mut report);
        }
        Direction::Rollback => {
            apply_table::<ObjectConfig>(txn, direction, ctx, &mut report);
            apply_table::<EdgeLink>(txn, direction, ctx, &mut report);
            apply_table::<UserRecord>(txn, direction, ctx, &mut report);
            apply_table::<GlobalInfo>(txn, direction, ctx, &mut report);
        }
    }
    report
}

fn apply_table<P: Persistable>(
    txn: &mut Transaction,
    direction: Direction,
    ctx: &ApplyContext<'_>,
    report: &mut WalkReport,
) {
    let mut table = P::committed(ctx.tables).lock();
    let slots = P::slots_mut(txn);
    let mut indices: Vec<usize> = (0..slots.capacity()).collect();
    if direction == Direction::Rollback {
        indices.reverse();
    }
    for index in indices {
        if let Some(staged) = slots.get_mut(index) {
            report.record(apply(staged, direction, ctx, &mut table));
        }
    }
}

/// Applies one staged entry.
///
/// Failures are logged and reported as [`Effect::Failed`]; the committed
/// table is not updated for a failed entry.
pub(crate) fn apply<P: Persistable>(
    staged: &mut StagedEntry<P>,
    direction: Direction,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> Effect {
    let state = staged.entry.state();
    let result = match (direction, state) {
        (_, EntryState::Invalid | EntryState::Valid) => Ok(Effect::Skipped),
        (Direction::Commit, EntryState::Create | EntryState::Modify) => {
            commit_upsert(staged, ctx, table)
        }
        (Direction::Commit, EntryState::Destroy) => commit_delete(staged, ctx, table),
        (Direction::Rollback, EntryState::Create) => rollback_create(staged, ctx, table),
        (Direction::Rollback, EntryState::Modify) => rollback_modify(staged, ctx, table),
        (Direction::Rollback, EntryState::Destroy) => rollback_destroy(staged, ctx, table),
    };
    result.unwrap_or_else(|e| {
        warn!(
            txn = %ctx.transaction_id,
            table = %P::TABLE,
            object_id = %staged.entry.header.object_id,
            %state,
            error = %e,
            "entry not applied"
        );
        Effect::Failed
    })
}

fn commit_upsert<P: Persistable>(
    staged: &mut StagedEntry<P>,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    let mut image = staged.entry.with_state(EntryState::Valid);
    let create = staged.entry.state() == EntryState::Create;
    let (entry_id, effect) = persist_upsert(&image, create, ctx)?;
    image.header.entry_id = entry_id;
    staged.entry.header.entry_id = entry_id;
    table.upsert(image)?;
    debug!(
        txn = %ctx.transaction_id,
        table = %P::TABLE,
        object_id = %staged.entry.header.object_id,
        %entry_id,
        ?effect,
        "entry committed"
    );
    Ok(effect)
}

/// Writes the committed image of an entry to the log that owns it.
///
/// Returns the entry id the image lives at afterwards. Without a session,
/// or for a general-log entry under a system-only session, nothing is
/// written and the image keeps its id.
pub(crate) fn persist_upsert<P: Persistable>(
    image: &Entry<P>,
    create: bool,
    ctx: &ApplyContext<'_>,
) -> DatabaseResult<(EntryId, Effect)> {
    let id = image.entry_id();
    let Some(session) = ctx.session else {
        return Ok((id, Effect::Folded));
    };
    let bytes = to_cbor(image)?;
    if ctx.routes_to_system(image) {
        let op = if create { SystemOp::Create } else { SystemOp::Update };
        let id = session.system_persist(op, image.system_key(), &bytes)?;
        return Ok((id, Effect::Written(id)));
    }
    if !session.has_general() {
        return Ok((id, Effect::Folded));
    }
    if id.is_placed() {
        session.modify(id, &bytes)?;
        Ok((id, Effect::Modified(id)))
    } else {
        let id = session.write(P::TABLE.sector(), &bytes)?;
        Ok((id, Effect::Written(id)))
    }
}

fn commit_delete<P: Persistable>(
    staged: &mut StagedEntry<P>,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    let key = staged.entry.key();
    if let Some(session) = ctx.session {
        if ctx.routes_to_system(&staged.entry) {
            session.system_persist(SystemOp::Delete, staged.entry.system_key(), &[])?;
        } else if session.has_general() {
            let id = placed_or(staged.entry.entry_id(), || {
                table.get(&key).map(Entry::entry_id)
            });
            if id.is_placed() {
                session.delete(id)?;
            }
        }
    }
    table.remove(&key);
    debug!(
        txn = %ctx.transaction_id,
        table = %P::TABLE,
        object_id = %staged.entry.header.object_id,
        "entry destroyed"
    );
    Ok(Effect::Deleted)
}

fn rollback_create<P: Persistable>(
    staged: &mut StagedEntry<P>,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    let live = P::discard_live(&staged.entry, ctx.topology).unwrap_or_else(|e| {
        warn!(txn = %ctx.transaction_id, table = %P::TABLE, error = %e, "live teardown failed");
        LiveOutcome::Missing
    });
    if live == LiveOutcome::Missing {
        warn!(
            txn = %ctx.transaction_id,
            table = %P::TABLE,
            object_id = %staged.entry.header.object_id,
            "reverting a create whose live object does not exist, duplicate entry tolerated"
        );
    }

    let key = staged.entry.key();
    let removed = table.remove(&key);

    if let Some(session) = ctx.session {
        if ctx.routes_to_system(&staged.entry) {
            session.system_persist(SystemOp::Delete, staged.entry.system_key(), &[])?;
        } else if session.has_general() {
            let mut id = placed_or(staged.entry.entry_id(), || removed.as_ref().map(Entry::entry_id));
            if !id.is_placed() {
                id = recover_entry_id::<P>(session, &key)?.unwrap_or(EntryId::UNPLACED);
            }
            if id.is_placed() && session.validate(id)? {
                session.delete(id)?;
            }
        }
    }

    staged.entry.header.state = EntryState::Invalid;
    staged.entry.header.entry_id = EntryId::UNPLACED;
    Ok(if live == LiveOutcome::Missing {
        Effect::Tolerated
    } else {
        Effect::Reverted
    })
}

fn rollback_modify<P: Persistable>(
    staged: &mut StagedEntry<P>,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    let key = staged.entry.key();
    let saved = staged
        .prior
        .clone()
        .or_else(|| table.get(&key).cloned())
        .ok_or_else(|| DatabaseError::not_found(format!("prior {} entry {key:?}", P::TABLE)))?;
    let mut saved = saved.with_state(EntryState::Valid);

    if let Err(e) = P::restore_live(&saved, ctx.topology) {
        warn!(txn = %ctx.transaction_id, table = %P::TABLE, error = %e, "live restore failed");
    }
    let id = placed_or(staged.entry.entry_id(), || Some(saved.entry_id()));
    saved.header.entry_id = persist_restored(&saved, id, SystemOp::Update, ctx)?;
    revert_into(staged, saved, table)
}

fn rollback_destroy<P: Persistable>(
    staged: &mut StagedEntry<P>,
    ctx: &ApplyContext<'_>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    let mut saved = staged.entry.with_state(EntryState::Valid);
    if let Err(e) = P::restore_live(&saved, ctx.topology) {
        warn!(txn = %ctx.transaction_id, table = %P::TABLE, error = %e, "live recreate failed");
    }
    saved.header.entry_id = persist_restored(&saved, saved.entry_id(), SystemOp::Create, ctx)?;
    revert_into(staged, saved, table)
}

fn revert_into<P: Persistable>(
    staged: &mut StagedEntry<P>,
    saved: Entry<P>,
    table: &mut TableGuard<'_, P>,
) -> DatabaseResult<Effect> {
    staged.entry.header.state = EntryState::Valid;
    staged.entry.header.entry_id = saved.entry_id();
    table.upsert(saved)?;
    Ok(Effect::Reverted)
}

/// Re-persists a reverted value, overwriting its record if it still exists.
fn persist_restored<P: Persistable>(
    image: &Entry<P>,
    id: EntryId,
    system_op: SystemOp,
    ctx: &ApplyContext<'_>,
) -> DatabaseResult<EntryId> {
    let Some(session) = ctx.session else {
        return Ok(id);
    };
    let bytes = to_cbor(image)?;
    if ctx.routes_to_system(image) {
        return session.system_persist(system_op, image.system_key(), &bytes);
    }
    if !session.has_general() {
        return Ok(id);
    }
    if id.is_placed() && session.validate(id)? {
        session.modify(id, &bytes)?;
        Ok(id)
    } else {
        session.write(P::TABLE.sector(), &bytes)
    }
}

/// Finds the committed record holding `key` by scanning its sector.
fn recover_entry_id<P: Persistable>(
    session: &LogSession<'_>,
    key: &P::Key,
) -> DatabaseResult<Option<EntryId>> {
    for (id, bytes) in session.read_sector(P::TABLE.sector())? {
        match from_cbor::<Entry<P>>(&bytes) {
            Ok(entry) if entry.key() == *key => {
                debug!(table = %P::TABLE, entry_id = %id, "recovered entry id from log");
                return Ok(Some(id));
            }
            Ok(_) => {}
            Err(e) => debug!(table = %P::TABLE, entry_id = %id, error = %e, "skipping undecodable record"),
        }
    }
    Ok(None)
}

fn placed_or(id: EntryId, fallback: impl FnOnce() -> Option<EntryId>) -> EntryId {
    if id.is_placed() {
        id
    } else {
        fallback().unwrap_or(EntryId::UNPLACED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::topology::InMemoryTopology;
    use crate::transaction::session::BusyRetry;
    use crate::transaction::TransactionInfo;
    use crate::types::JobNumber;
    use duplexdb_persist::{InMemoryPersistLog, InMemorySystemLog, PersistLog, SectorType};
    use std::time::Duration;

    const RETRY: BusyRetry = BusyRetry {
        attempts: 1,
        delay: Duration::from_millis(1),
    };

    struct Fixture {
        tables: EntryTables,
        topology: InMemoryTopology,
        persist: InMemoryPersistLog,
        system: InMemorySystemLog,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tables: EntryTables::new(&EngineConfig::default()),
                topology: InMemoryTopology::new(),
                persist: InMemoryPersistLog::new(),
                system: InMemorySystemLog::new(),
            }
        }

        fn run(&self, txn: &mut Transaction, direction: Direction, persist: bool) -> WalkReport {
            let mut session = persist.then(|| LogSession::open(&self.persist, &self.system, RETRY).unwrap());
            let report = {
                let ctx = ApplyContext {
                    tables: &self.tables,
                    topology: &self.topology,
                    session: session.as_ref(),
                    last_system_object_id: ObjectId(9),
                    transaction_id: txn.id(),
                };
                walk(txn, direction, &ctx)
            };
            if let Some(session) = session.as_mut() {
                session.commit_general().unwrap();
                session.commit_system().unwrap();
            }
            report
        }
    }

    fn txn() -> Transaction {
        Transaction::new(
            TransactionId(1),
            TransactionInfo::new(JobNumber(1)),
            EngineConfig::default().max_objects(4).slot_limits(),
        )
    }

    fn object(class_id: u32) -> ObjectConfig {
        ObjectConfig {
            class_id,
            config: vec![class_id as u8; 4],
        }
    }

    #[test]
    fn commit_writes_general_and_folds() {
        let fx = Fixture::new();
        let mut txn = txn();
        txn.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();

        let report = fx.run(&mut txn, Direction::Commit, true);
        assert_eq!(report.applied, 1);

        let committed = fx.tables.objects().get(&ObjectId(100)).unwrap();
        assert_eq!(committed.state(), EntryState::Valid);
        assert!(committed.entry_id().is_placed());
        assert!(fx.persist.record(committed.entry_id()).is_some());
        assert_eq!(txn.objects().entry_ids()[0], committed.entry_id().as_u64());
    }

    #[test]
    fn system_range_routes_to_system_log() {
        let fx = Fixture::new();
        let mut txn = txn();
        txn.objects.stage(Entry::create(ObjectId(3), object(1)), None).unwrap();
        fx.run(&mut txn, Direction::Commit, true);

        assert_eq!(fx.system.len(), 1);
        assert!(fx.persist.is_empty());
        let committed = fx.tables.objects().get(&ObjectId(3)).unwrap();
        assert_eq!(
            committed.entry_id(),
            committed.system_key().entry_id()
        );
    }

    #[test]
    fn modify_of_never_persisted_entry_is_written_fresh() {
        let fx = Fixture::new();
        fx.tables
            .objects()
            .insert_valid(Entry::valid(ObjectId(200), EntryId::UNPLACED, object(1)))
            .unwrap();
        let committed = fx.tables.objects().get(&ObjectId(200));
        let mut txn = txn();
        txn.objects.stage(Entry::modify(ObjectId(200), object(2)), committed).unwrap();

        fx.run(&mut txn, Direction::Commit, true);
        let entry = fx.tables.objects().get(&ObjectId(200)).unwrap();
        assert!(entry.entry_id().is_placed());
        assert_eq!(entry.state(), EntryState::Valid);
        assert_eq!(entry.payload, object(2));
    }

    #[test]
    fn destroy_deletes_record_and_entry() {
        let fx = Fixture::new();
        let mut create = txn();
        create.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();
        fx.run(&mut create, Direction::Commit, true);
        let id = fx.tables.objects().get(&ObjectId(100)).unwrap().entry_id();

        let mut destroy = txn();
        let committed = fx.tables.objects().get(&ObjectId(100));
        destroy
            .objects
            .stage(Entry::destroy(ObjectId(100), ObjectConfig::default()), committed)
            .unwrap();
        fx.run(&mut destroy, Direction::Commit, true);

        assert!(fx.tables.objects().is_empty());
        assert!(fx.persist.record(id).is_none());
    }

    #[test]
    fn rollback_after_commit_recovers_entry_id_from_log() {
        let fx = Fixture::new();
        let mut txn = txn();
        txn.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();
        fx.topology.create_object(ObjectId(100), 1, b"").unwrap();
        let before_commit = txn.clone();
        fx.run(&mut txn, Direction::Commit, true);
        assert_eq!(fx.persist.len(), 1);

        // Neither the pre-commit copy nor the table knows the entry id.
        fx.tables.objects().lock().remove(&ObjectId(100));
        let mut reverted = before_commit;
        let report = fx.run(&mut reverted, Direction::Rollback, true);

        assert_eq!(report.applied, 1);
        assert!(fx.persist.is_empty());
        assert!(fx.tables.objects().is_empty());
        assert!(!fx.topology.object_exists(ObjectId(100)));
        assert_eq!(
            reverted.objects().get(0).unwrap().entry.state(),
            EntryState::Invalid
        );
    }

    #[test]
    fn rollback_of_create_without_live_object_is_tolerated() {
        let fx = Fixture::new();
        let mut txn = txn();
        txn.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();
        let report = fx.run(&mut txn, Direction::Rollback, false);
        assert_eq!(report.tolerated, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn rollback_modify_restores_prior_value() {
        let fx = Fixture::new();
        let mut seed = txn();
        seed.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();
        fx.topology.create_object(ObjectId(100), 1, &object(1).config).unwrap();
        fx.run(&mut seed, Direction::Commit, true);
        let original = fx.tables.objects().get(&ObjectId(100)).unwrap();

        let mut txn = txn();
        txn.objects
            .stage(Entry::modify(ObjectId(100), object(2)), Some(original.clone()))
            .unwrap();
        fx.topology.reconfigure_object(ObjectId(100), &object(2).config).unwrap();
        fx.run(&mut txn, Direction::Commit, true);
        assert_eq!(fx.tables.objects().get(&ObjectId(100)).unwrap().payload, object(2));

        fx.run(&mut txn, Direction::Rollback, true);
        let restored = fx.tables.objects().get(&ObjectId(100)).unwrap();
        assert_eq!(restored, original);
        assert_eq!(fx.topology.object(ObjectId(100)).unwrap().config, object(1).config);
        let bytes = fx.persist.record(original.entry_id()).unwrap();
        assert_eq!(from_cbor::<Entry<ObjectConfig>>(&bytes).unwrap().payload, object(1));
    }

    #[test]
    fn memory_only_commit_keeps_adopted_ids() {
        let fx = Fixture::new();
        let mut txn = txn();
        txn.objects.stage(Entry::create(ObjectId(100), object(1)), None).unwrap();
        txn.objects.adopt_entry_ids(&[77]);
        fx.run(&mut txn, Direction::Commit, false);

        assert_eq!(
            fx.tables.objects().get(&ObjectId(100)).unwrap().entry_id(),
            EntryId::new(77)
        );
        assert!(fx.persist.is_empty());
        assert!(!fx.persist.has_open_transaction());
        assert!(fx.persist.read_sector(SectorType::Objects).unwrap().is_empty());
    }

    #[test]
    fn failed_entry_leaves_table_alone() {
        let fx = Fixture::new();
        let mut txn = txn();
        // Placed id with no record behind it: modify fails.
        let ghost = Entry::valid(ObjectId(300), EntryId::new(999), object(1));
        fx.tables.objects().insert_valid(ghost.clone()).unwrap();
        txn.objects
            .stage(Entry::modify(ObjectId(300), object(5)), Some(ghost.clone()))
            .unwrap();

        let report = fx.run(&mut txn, Direction::Commit, true);
        assert_eq!(report.failed, 1);
        assert_eq!(fx.tables.objects().get(&ObjectId(300)).unwrap(), ghost);
    }
}
