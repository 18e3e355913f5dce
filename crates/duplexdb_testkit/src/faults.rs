//! Fault injection for the persistence logs.
//!
//! [`FaultyPersistLog`] wraps an [`InMemoryPersistLog`] and fails the next
//! N calls of a given kind. Counters are consumed as faults fire, so a test
//! arms exactly the failures it expects to see.

use duplexdb_persist::{
    EntryId, InMemoryPersistLog, PersistCompletion, PersistError, PersistHandle, PersistLog,
    PersistResult, ReplayOutcome, SectorType,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// A general log that fails on demand.
#[derive(Debug, Default)]
pub struct FaultyPersistLog {
    inner: InMemoryPersistLog,
    busy_starts: AtomicU32,
    failing_writes: AtomicU32,
    failing_commits: AtomicU32,
    starts: AtomicU64,
}

impl FaultyPersistLog {
    /// Creates a log with no faults armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapped log.
    #[must_use]
    pub fn inner(&self) -> &InMemoryPersistLog {
        &self.inner
    }

    /// Reports the next `count` transaction starts as busy.
    pub fn fail_starts_busy(&self, count: u32) {
        self.busy_starts.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` entry writes, modifies or deletes.
    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Aborts the next `count` commits and reports them failed.
    pub fn fail_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Returns how many transaction starts were attempted.
    #[must_use]
    pub fn start_attempts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Returns the number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no record is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write_fault(&self, what: &str) -> PersistResult<()> {
        if Self::take(&self.failing_writes) {
            debug!(what, "injected write fault");
            return Err(PersistError::Io(std::io::Error::other(format!(
                "injected {what} failure"
            ))));
        }
        Ok(())
    }
}

impl PersistLog for FaultyPersistLog {
    fn start_transaction(&self) -> PersistResult<PersistHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.busy_starts) {
            debug!("injected busy start");
            return Err(PersistError::Busy);
        }
        self.inner.start_transaction()
    }

    fn write_entry(
        &self,
        handle: PersistHandle,
        sector: SectorType,
        data: &[u8],
    ) -> PersistResult<EntryId> {
        self.write_fault("write")?;
        self.inner.write_entry(handle, sector, data)
    }

    fn modify_entry(
        &self,
        handle: PersistHandle,
        data: &[u8],
        entry_id: EntryId,
    ) -> PersistResult<()> {
        self.write_fault("modify")?;
        self.inner.modify_entry(handle, data, entry_id)
    }

    fn delete_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<()> {
        self.write_fault("delete")?;
        self.inner.delete_entry(handle, entry_id)
    }

    fn commit_transaction(&self, handle: PersistHandle, completion: PersistCompletion) {
        if Self::take(&self.failing_commits) {
            debug!(%handle, "injected commit failure");
            self.inner.abort_transaction(
                handle,
                Box::new(move |_| {
                    completion(Err(PersistError::transaction_failed("injected commit failure")));
                }),
            );
            return;
        }
        self.inner.commit_transaction(handle, completion);
    }

    fn abort_transaction(&self, handle: PersistHandle, completion: PersistCompletion) {
        self.inner.abort_transaction(handle, completion);
    }

    fn validate_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<bool> {
        self.inner.validate_entry(handle, entry_id)
    }

    fn read_sector(&self, sector: SectorType) -> PersistResult<Vec<(EntryId, Vec<u8>)>> {
        self.inner.read_sector(sector)
    }

    fn replay(&self) -> ReplayOutcome {
        self.inner.replay()
    }
}
