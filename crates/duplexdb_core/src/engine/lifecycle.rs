//! Start, stage, commit, abort and rollback.

use super::Engine;
use crate::codec::to_cbor;
use crate::entry::{EdgeEntry, GlobalInfoEntry, ObjectEntry, UserEntry};
use crate::entry::{Entry, EntryState, LiveOutcome, Persistable};
use crate::error::{DatabaseError, DatabaseResult};
use crate::hooks::HookType;
use crate::transaction::{
    Direction, Placement, StagedEntry, TakenTransaction, Transaction, TransactionInfo, WalkReport,
};
use crate::types::{TransactionId, TransactionState};
use duplexdb_peer::{
    EntryIdMap, PeerOperation, PeerRequest, StagedRecord, TransactionBackup, TransactionSummary,
};
use duplexdb_persist::{IntentDirection, IntentPhase, IntentRecord};
use tracing::{debug, error, info, warn};

/// Where an entry was staged and what the slot held before.
pub(super) struct Staged<P> {
    pub placement: Placement,
    pub before: Option<StagedEntry<P>>,
}

pub(super) fn peer_request(
    operation: PeerOperation,
    txn: &Transaction,
    staged: Option<StagedRecord>,
) -> PeerRequest {
    PeerRequest {
        operation,
        summary: txn.summary(),
        staged,
    }
}

impl Engine {
    /// Starts a transaction and replicates the start to the peer.
    ///
    /// # Errors
    ///
    /// - `WrongRole` on the passive controller
    /// - `AlreadyActive` if a transaction is in flight
    /// - `Timeout` or `PeerFailure` if a live peer does not confirm; the
    ///   slot is released
    pub fn start(&self, info: TransactionInfo) -> DatabaseResult<TransactionId> {
        self.ensure_active_role()?;
        let txn = self.manager.begin(info)?;
        let id = txn.id();
        if let Err(e) = self
            .peer
            .round_trip(peer_request(PeerOperation::Start, &txn, None))
        {
            error!(txn = %id, error = %e, "peer did not confirm start");
            txn.finish();
            return Err(e);
        }
        info!(txn = %id, job = %info.job_number, "transaction started");
        Ok(id)
    }

    /// Stages `entry` into the active transaction and replicates it.
    ///
    /// Returns the slot index the entry occupies.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless a transaction is active
    /// - `CapacityExceeded`, `DuplicateKey` or `NotFound` from staging
    /// - topology errors from the live effect
    /// - peer errors; the entry is unstaged, and on `ProtocolMismatch` or
    ///   `Timeout` the transaction is aborted
    pub fn stage_entry<P: Persistable>(&self, entry: Entry<P>) -> DatabaseResult<usize> {
        self.ensure_active_role()?;
        let mut txn = self.manager.take_in(&[TransactionState::Active])?;
        let bytes = to_cbor(&entry)?;
        let staged = self.stage_local(&mut txn, entry, None)?;
        let index = staged.placement.index;

        let replicated = u32::try_from(index)
            .map_err(|_| DatabaseError::invalid_entry("slot index out of range"))
            .and_then(|slot| {
                let record = StagedRecord {
                    table: P::TABLE.as_byte(),
                    slot,
                    bytes,
                };
                self.peer
                    .round_trip(peer_request(PeerOperation::Stage, &txn, Some(record)))
            });
        if let Err(e) = replicated {
            warn!(txn = %txn.id(), table = %P::TABLE, slot = index, error = %e, "stage not replicated, unstaging");
            self.unstage(&mut txn, staged);
            match e {
                DatabaseError::ProtocolMismatch { .. } => {
                    error!(txn = %txn.id(), error = %e, "peer holds another transaction, aborting");
                    self.revert_in_memory(txn);
                }
                // The peer may still hold the entry in its slot.
                DatabaseError::Timeout { .. } => {
                    error!(txn = %txn.id(), error = %e, "stage unconfirmed, aborting on both controllers");
                    self.unwind(txn);
                }
                _ => {}
            }
            return Err(e);
        }

        debug!(txn = %txn.id(), table = %P::TABLE, slot = index, merged = staged.placement.merge, "entry staged");
        Ok(index)
    }

    /// Stages an object entry.
    ///
    /// # Errors
    ///
    /// See [`stage_entry`](Self::stage_entry).
    pub fn add_object_entry(&self, entry: ObjectEntry) -> DatabaseResult<usize> {
        self.stage_entry(entry)
    }

    /// Stages a user entry.
    ///
    /// # Errors
    ///
    /// See [`stage_entry`](Self::stage_entry).
    pub fn add_user_entry(&self, entry: UserEntry) -> DatabaseResult<usize> {
        self.stage_entry(entry)
    }

    /// Stages an edge entry.
    ///
    /// # Errors
    ///
    /// See [`stage_entry`](Self::stage_entry).
    pub fn add_edge_entry(&self, entry: EdgeEntry) -> DatabaseResult<usize> {
        self.stage_entry(entry)
    }

    /// Stages a global-info entry.
    ///
    /// # Errors
    ///
    /// See [`stage_entry`](Self::stage_entry).
    pub fn add_global_info_entry(&self, entry: GlobalInfoEntry) -> DatabaseResult<usize> {
        self.stage_entry(entry)
    }

    /// Returns the first free slot of `P`'s table in the active transaction.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless a transaction is active, `CapacityExceeded` if
    /// every slot is taken.
    pub fn free_slot<P: Persistable>(&self) -> DatabaseResult<usize> {
        let txn = self.manager.take_in(&[TransactionState::Active])?;
        P::slots(&txn).free_index()
    }

    /// Stages `entry` on this controller only, applying its live effect.
    ///
    /// `expected_slot` is the slot the peer used; staging into any other
    /// slot is refused.
    pub(super) fn stage_local<P: Persistable>(
        &self,
        txn: &mut Transaction,
        entry: Entry<P>,
        expected_slot: Option<usize>,
    ) -> DatabaseResult<Staged<P>> {
        txn.ensure_active()?;
        let committed = P::committed(&self.tables).get(&entry.key());
        let placement = P::slots(txn).plan(&entry, committed.as_ref())?;
        if let Some(slot) = expected_slot {
            if slot != placement.index {
                return Err(DatabaseError::invalid_entry(format!(
                    "peer staged {} entry in slot {slot}, local slot is {}",
                    P::TABLE,
                    placement.index
                )));
            }
        }
        let before = P::slots(txn).get(placement.index).cloned();
        P::stage_live(&entry, &*self.topology)?;
        P::slots_mut(txn).stage(entry, committed)?;
        Ok(Staged { placement, before })
    }

    /// Takes a staged entry back out, undoing its live effect.
    pub(super) fn unstage<P: Persistable>(&self, txn: &mut Transaction, staged: Staged<P>) {
        let index = staged.placement.index;
        let topology = &*self.topology;
        let live = match (&staged.before, P::slots(txn).get(index)) {
            (Some(before), _) => P::restore_live(&before.entry, topology),
            (None, Some(current)) if current.entry.state() == EntryState::Create => {
                P::discard_live(&current.entry, topology)
            }
            (None, Some(current)) => current
                .prior
                .as_ref()
                .map_or(Ok(LiveOutcome::Untouched), |prior| P::restore_live(prior, topology)),
            (None, None) => Ok(LiveOutcome::Untouched),
        };
        if let Err(e) = live {
            warn!(table = %P::TABLE, slot = index, error = %e, "live effect not undone");
        }
        let slots = P::slots_mut(txn);
        match staged.before {
            Some(before) => slots.place(index, before),
            None => slots.release(index),
        }
    }

    /// Commits the active transaction.
    ///
    /// Entries are written to the logs, folded into the committed tables,
    /// and the commit is replicated to the peer. A failed log commit
    /// reverts the transaction; a peer that fails to confirm after the
    /// logs committed is reported but does not undo the commit.
    ///
    /// # Errors
    ///
    /// - `WrongRole` on the passive controller
    /// - `InvalidState` unless a transaction is active
    /// - `Busy` or `PersistFailure` from the logs; the transaction is gone
    /// - peer errors from replicating the commit
    pub fn commit(&self) -> DatabaseResult<()> {
        self.ensure_active_role()?;
        let mut txn = self.manager.take_in(&[TransactionState::Active])?;
        let id = txn.id();
        let job = txn.job_number();

        self.hooks.check_and_run(HookType::WaitInUpdateTransaction, id);
        self.hooks.check_and_run(HookType::PanicInUpdateTransaction, id);
        txn.set_state(TransactionState::Commit);
        info!(txn = %id, %job, staged = txn.staged_count(), "committing transaction");

        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                error!(txn = %id, error = %e, "logs unavailable, aborting");
                self.unwind(txn);
                return Err(e);
            }
        };
        let report = self.walk(&mut txn, Direction::Commit, Some(&session));
        if report.failed > 0 {
            warn!(txn = %id, failed = report.failed, "entries skipped by commit");
        }

        self.hooks.check_and_run(HookType::WaitBeforeTransactionPersist, id);
        self.hooks.check_and_run(HookType::PanicBeforeTransactionPersist, id);

        let intent = IntentRecord::prepared(id.as_u64(), job.as_u64(), IntentDirection::Commit);
        if let Err(e) = self
            .record_intent(&intent)
            .and_then(|()| session.commit_general())
        {
            error!(txn = %id, error = %e, "general log commit failed, aborting");
            session.abort();
            drop(session);
            self.clear_intent();
            self.unwind(txn);
            return Err(e);
        }
        if let Err(e) = self.record_intent(&intent.with_phase(IntentPhase::GeneralCommitted)) {
            warn!(txn = %id, error = %e, "intent phase not recorded");
        }
        if let Err(e) = session.commit_system() {
            error!(txn = %id, error = %e, "system log commit failed after general log commit, rolling back");
            drop(session);
            if let Err(rollback) = self.rollback_taken(txn) {
                error!(txn = %id, error = %rollback, "rollback after failed commit did not complete");
            }
            return Err(e);
        }
        drop(session);
        self.clear_intent();

        let replicated = self.replicate_commit(&txn);
        if let Err(e) = &replicated {
            warn!(txn = %id, error = %e, "peer did not confirm commit, local commit stands");
        }
        txn.finish();
        info!(txn = %id, applied = report.applied, tolerated = report.tolerated, "transaction committed");
        replicated
    }

    /// Sends Commit, by bulk transfer when the message is large, then
    /// Invalidate.
    ///
    /// Invalidate goes out even when the Commit was not confirmed, so a
    /// peer that missed the Commit still folds the durable result and
    /// releases its slot. The first failure is returned.
    fn replicate_commit(&self, txn: &Transaction) -> DatabaseResult<()> {
        if !self.peer.is_connected() {
            return Ok(());
        }
        let committed = self.send_commit(txn);
        if let Err(e) = &committed {
            warn!(txn = %txn.id(), error = %e, "peer did not confirm commit, invalidating anyway");
        }
        let invalidated = self
            .peer
            .round_trip(peer_request(PeerOperation::Invalidate, txn, None));
        committed.and(invalidated)
    }

    fn send_commit(&self, txn: &Transaction) -> DatabaseResult<()> {
        let request = peer_request(PeerOperation::Commit, txn, None);
        let size = to_cbor(&request)?.len();
        match self.peer.backup_address() {
            Some(address) if size > self.config.dma_threshold => {
                let summary = request.summary;
                let backup = TransactionBackup {
                    transaction_id: summary.transaction_id,
                    job_number: summary.job_number,
                    entry_ids: summary.entry_ids.clone(),
                };
                let lean = PeerRequest {
                    operation: PeerOperation::CommitDma,
                    summary: TransactionSummary {
                        entry_ids: EntryIdMap::default(),
                        ..summary
                    },
                    staged: None,
                };
                debug!(txn = %txn.id(), size, "replicating commit by bulk transfer");
                self.peer.round_trip_memory(lean, &backup, address)
            }
            _ => self.peer.round_trip(request),
        }
    }

    /// Aborts the in-flight transaction without touching the logs.
    ///
    /// Used while nothing durable has been committed. The abort is
    /// replicated first; live effects and committed tables are reverted
    /// and the slot is released.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the transaction is active or committing.
    pub fn abort(&self) -> DatabaseResult<()> {
        let txn = self.manager.take_in(&[TransactionState::Active, TransactionState::Commit])?;
        self.unwind(txn);
        Ok(())
    }

    fn unwind(&self, txn: TakenTransaction<'_>) {
        let id = txn.id();
        if self.is_active() {
            if let Err(e) = self
                .peer
                .round_trip(peer_request(PeerOperation::Abort, &txn, None))
            {
                warn!(txn = %id, error = %e, "peer did not confirm abort");
            }
        }
        let report = self.revert_in_memory(txn);
        info!(txn = %id, reverted = report.applied, tolerated = report.tolerated, "transaction aborted");
    }

    pub(super) fn revert_in_memory(&self, mut txn: TakenTransaction<'_>) -> WalkReport {
        txn.set_state(TransactionState::Rollback);
        let report = self.walk(&mut txn, Direction::Rollback, None);
        txn.finish();
        report
    }

    /// Rolls the in-flight transaction back durably.
    ///
    /// Reverts live effects and committed tables like
    /// [`abort`](Self::abort), and also re-persists the reverted values
    /// through both logs. Safe to run again on a transaction whose previous
    /// rollback did not finish.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if no transaction is in flight
    /// - `Busy` or `PersistFailure` from the logs; the transaction stays in
    ///   `ROLLBACK` and the rollback can be re-run
    pub fn rollback(&self) -> DatabaseResult<()> {
        let txn = self.manager.take_in(&[
            TransactionState::Active,
            TransactionState::Commit,
            TransactionState::Rollback,
        ])?;
        self.rollback_taken(txn)
    }

    pub(super) fn rollback_taken(&self, mut txn: TakenTransaction<'_>) -> DatabaseResult<()> {
        let id = txn.id();
        let job = txn.job_number();
        self.hooks.check_and_run(HookType::WaitInUpdateRollbackTransaction, id);
        self.hooks.check_and_run(HookType::PanicInUpdateRollbackTransaction, id);

        if self.is_active() {
            if let Err(e) = self
                .peer
                .round_trip(peer_request(PeerOperation::Abort, &txn, None))
            {
                warn!(txn = %id, error = %e, "peer did not confirm abort");
            }
        }
        txn.set_state(TransactionState::Rollback);
        info!(txn = %id, %job, "rolling back transaction");

        let mut session = self.open_session()?;
        // Staged entries change as they are reverted; keep the slot intact
        // until the logs have committed so a failed attempt can be re-run.
        let mut reverted = (*txn).clone();
        let report = self.walk(&mut reverted, Direction::Rollback, Some(&session));

        self.hooks.check_and_run(HookType::WaitBeforeRollbackTransactionPersist, id);
        self.hooks.check_and_run(HookType::PanicBeforeRollbackTransactionPersist, id);

        let intent = IntentRecord::prepared(id.as_u64(), job.as_u64(), IntentDirection::Rollback);
        self.record_intent(&intent)?;
        if let Err(e) = session.commit_general() {
            error!(txn = %id, error = %e, "general log commit failed during rollback");
            return Err(e);
        }
        if let Err(e) = self.record_intent(&intent.with_phase(IntentPhase::GeneralCommitted)) {
            warn!(txn = %id, error = %e, "intent phase not recorded");
        }
        session.commit_system()?;
        drop(session);
        self.clear_intent();

        txn.finish();
        info!(
            txn = %id,
            reverted = report.applied,
            tolerated = report.tolerated,
            failed = report.failed,
            "transaction rolled back"
        );
        Ok(())
    }
}
