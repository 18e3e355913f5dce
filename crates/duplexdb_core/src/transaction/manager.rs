//! Transaction manager.

use crate::config::SlotLimits;
use crate::error::{DatabaseError, DatabaseResult};
use crate::transaction::state::{Transaction, TransactionInfo};
use crate::types::{TransactionId, TransactionState};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Owns the single transaction slot.
///
/// At most one transaction exists at a time. Work on it goes through a
/// [`TakenTransaction`], which holds the slot lock for its lifetime and puts
/// the transaction back when dropped, unless [`finish`](TakenTransaction::finish)
/// released it. The state and id of the slot are mirrored in atomics so they
/// can be read without waiting for a committer.
pub struct TransactionManager {
    slot: Mutex<Option<Transaction>>,
    state: AtomicU8,
    current: AtomicU64,
    next_id: AtomicU64,
    limits: SlotLimits,
}

impl TransactionManager {
    /// Creates a manager with an empty slot.
    #[must_use]
    pub fn new(limits: SlotLimits) -> Self {
        Self {
            slot: Mutex::new(None),
            state: AtomicU8::new(TransactionState::Inactive.as_byte()),
            current: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    /// Returns the state of the slot.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        TransactionState::from_byte(self.state.load(Ordering::SeqCst))
            .unwrap_or(TransactionState::Inactive)
    }

    /// Returns the id of the transaction in the slot.
    #[must_use]
    pub fn current_id(&self) -> TransactionId {
        TransactionId(self.current.load(Ordering::SeqCst))
    }

    /// Returns the id the next [`begin`](Self::begin) will issue.
    #[must_use]
    pub fn peek_next_id(&self) -> TransactionId {
        TransactionId(self.next_id.load(Ordering::SeqCst))
    }

    fn mirror(&self, txn: Option<&Transaction>) {
        let (state, id) = txn.map_or((TransactionState::Inactive, 0), |t| {
            (t.state(), t.id().as_u64())
        });
        self.state.store(state.as_byte(), Ordering::SeqCst);
        self.current.store(id, Ordering::SeqCst);
    }

    fn take<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Option<Transaction>>,
    ) -> Option<TakenTransaction<'a>> {
        let txn = guard.take()?;
        self.mirror(Some(&txn));
        Some(TakenTransaction {
            guard,
            manager: self,
            txn,
            finished: false,
        })
    }

    /// Opens a new transaction with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if the slot is occupied.
    pub fn begin(&self, info: TransactionInfo) -> DatabaseResult<TakenTransaction<'_>> {
        let mut guard = self.slot.lock();
        if let Some(existing) = guard.as_ref() {
            return Err(DatabaseError::AlreadyActive { id: existing.id() });
        }
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        *guard = Some(Transaction::new(id, info, self.limits));
        self.take(guard)
            .ok_or_else(|| DatabaseError::invalid_state(&[], TransactionState::Inactive))
    }

    /// Opens a transaction under an id chosen by the peer.
    ///
    /// A transaction still in the slot is replaced. Later local ids are
    /// issued above `id`.
    pub fn begin_with_id(&self, id: TransactionId, info: TransactionInfo) -> TakenTransaction<'_> {
        let mut guard = self.slot.lock();
        if let Some(stale) = guard.take() {
            warn!(stale = %stale.id(), state = %stale.state(), txn = %id, "replacing stale transaction");
        }
        self.next_id.fetch_max(id.as_u64() + 1, Ordering::SeqCst);
        let txn = Transaction::new(id, info, self.limits);
        self.mirror(Some(&txn));
        TakenTransaction {
            guard,
            manager: self,
            txn,
            finished: false,
        }
    }

    /// Takes the transaction if its state is one of `allowed`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the slot is empty or in another state.
    pub fn take_in(&self, allowed: &[TransactionState]) -> DatabaseResult<TakenTransaction<'_>> {
        let guard = self.slot.lock();
        let state = guard
            .as_ref()
            .map_or(TransactionState::Inactive, Transaction::state);
        if !allowed.contains(&state) {
            return Err(DatabaseError::invalid_state(allowed, state));
        }
        self.take(guard)
            .ok_or_else(|| DatabaseError::invalid_state(allowed, TransactionState::Inactive))
    }

    /// Takes the transaction whatever its state, if there is one.
    pub fn take_any(&self) -> Option<TakenTransaction<'_>> {
        self.take(self.slot.lock())
    }

    /// Puts a transaction restored from elsewhere into the empty slot.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if the slot is occupied.
    pub fn install(&self, txn: Transaction) -> DatabaseResult<()> {
        let mut guard = self.slot.lock();
        if let Some(existing) = guard.as_ref() {
            return Err(DatabaseError::AlreadyActive { id: existing.id() });
        }
        self.next_id.fetch_max(txn.id().as_u64() + 1, Ordering::SeqCst);
        self.mirror(Some(&txn));
        *guard = Some(txn);
        Ok(())
    }

    /// Returns a copy of the transaction in the slot.
    #[must_use]
    pub fn snapshot(&self) -> Option<Transaction> {
        self.slot.lock().clone()
    }

    /// Empties the slot.
    pub fn clear(&self) {
        let mut guard = self.slot.lock();
        if let Some(txn) = guard.take() {
            debug!(txn = %txn.id(), state = %txn.state(), "transaction slot cleared");
        }
        self.mirror(None);
    }

    /// Blocks until the slot is empty, checking every `poll`.
    pub fn wait_inactive(&self, poll: Duration) {
        while self.state() != TransactionState::Inactive {
            std::thread::sleep(poll);
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("state", &self.state())
            .field("current", &self.current_id())
            .field("next_id", &self.peek_next_id())
            .finish_non_exhaustive()
    }
}

/// Exclusive use of the transaction in the slot.
///
/// Dropping the guard returns the transaction to the slot in whatever state
/// it reached. [`finish`](Self::finish) empties the slot instead.
pub struct TakenTransaction<'a> {
    guard: MutexGuard<'a, Option<Transaction>>,
    manager: &'a TransactionManager,
    txn: Transaction,
    finished: bool,
}

impl TakenTransaction<'_> {
    /// Moves the transaction to `state`.
    pub fn set_state(&mut self, state: TransactionState) {
        self.txn.set_state(state);
        self.manager.mirror(Some(&self.txn));
    }

    /// Releases the slot; the transaction is gone.
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Deref for TakenTransaction<'_> {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl DerefMut for TakenTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.txn
    }
}

impl Drop for TakenTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            *self.guard = None;
            self.manager.mirror(None);
        } else {
            let txn = std::mem::take(&mut self.txn);
            self.manager.mirror(Some(&txn));
            *self.guard = Some(txn);
        }
    }
}
