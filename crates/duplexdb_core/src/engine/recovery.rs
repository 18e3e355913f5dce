//! Recovery after the peer controller dies.
//!
//! The surviving controller decides from its own slot, the intent record and
//! the general log's replay outcome whether the interrupted transaction
//! reached durability:
//!
//! | slot       | decision                                            |
//! |------------|-----------------------------------------------------|
//! | `INACTIVE` | nothing to do                                       |
//! | `ACTIVE`   | roll back                                           |
//! | `COMMIT`   | finish the commit if it is durable, else roll back  |
//! | `ROLLBACK` | run the rollback again                              |
//!
//! The slot is empty afterwards whatever happened.

use super::Engine;
use crate::error::DatabaseResult;
use crate::transaction::session::LogSession;
use crate::transaction::Direction;
use crate::types::{TransactionId, TransactionState};
use duplexdb_persist::{IntentDirection, IntentPhase, IntentRecord, ReplayOutcome};
use tracing::{error, info, warn};

/// What recovery did with the interrupted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No transaction was in flight.
    Nothing,
    /// The transaction was rolled back.
    RolledBack,
    /// A durable commit was finished and its job reported done.
    FinishedCommit,
}

impl Engine {
    /// Takes over after the peer controller died.
    ///
    /// Promotes this controller to active, replays both logs, and finishes
    /// or reverts the transaction in the slot.
    ///
    /// # Errors
    ///
    /// Returns the error of a rollback or commit finish that could not
    /// complete. The slot is cleared regardless.
    pub fn recover_after_peer_death(&self) -> DatabaseResult<RecoveryAction> {
        self.promote();
        let replay = self.persist.replay();
        self.system.replay();
        let intent = self.intents.load().unwrap_or_else(|e| {
            warn!(error = %e, "intent record unreadable, ignoring it");
            None
        });

        let state = self.state();
        let id = self.current_id();
        info!(txn = %id, %state, ?replay, ?intent, "recovering after peer death");

        let result = match state {
            TransactionState::Inactive => Ok(RecoveryAction::Nothing),
            TransactionState::Active | TransactionState::Rollback => {
                self.rollback().map(|()| RecoveryAction::RolledBack)
            }
            TransactionState::Commit if commit_is_durable(id, intent.as_ref(), replay) => {
                self.finish_commit().map(|()| RecoveryAction::FinishedCommit)
            }
            TransactionState::Commit => self.rollback().map(|()| RecoveryAction::RolledBack),
        };

        let left = self.state();
        if left != TransactionState::Inactive {
            warn!(txn = %id, state = %left, "recovery left the transaction behind, clearing it");
            self.manager.clear();
        }
        self.clear_intent();

        match &result {
            Ok(action) => info!(txn = %id, ?action, "recovery finished"),
            Err(e) => error!(txn = %id, error = %e, "recovery did not complete"),
        }
        result
    }

    /// Applies a commit whose general log is already durable.
    ///
    /// Only the system log is written; general-log entries fold into memory
    /// under the ids the peer decided.
    fn finish_commit(&self) -> DatabaseResult<()> {
        let mut txn = self.manager.take_in(&[TransactionState::Commit])?;
        let id = txn.id();
        let job = txn.job_number();

        let mut session =
            LogSession::open_system_only(&*self.persist, &*self.system, self.busy_retry())?;
        let report = self.walk(&mut txn, Direction::Commit, Some(&session));
        session.commit_system()?;
        drop(session);

        self.jobs.mark_job_done(job);
        txn.finish();
        info!(txn = %id, %job, applied = report.applied, failed = report.failed, "interrupted commit finished");
        Ok(())
    }
}

/// Decides whether the general log holds the commit of `id`.
///
/// An intent for `id` is trusted first: a commit intent that got past the
/// general log is durable, and a rollback intent never is. Without one the
/// log's replay outcome decides.
fn commit_is_durable(
    id: TransactionId,
    intent: Option<&IntentRecord>,
    replay: ReplayOutcome,
) -> bool {
    match intent {
        Some(intent) if intent.transaction_id == id.as_u64() => {
            intent.direction == IntentDirection::Commit
                && (intent.phase == IntentPhase::GeneralCommitted
                    || replay == ReplayOutcome::Committed)
        }
        _ => replay == ReplayOutcome::Committed,
    }
}
