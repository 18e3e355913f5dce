//! In-memory persistence logs for testing and simulation.

use crate::error::{PersistError, PersistResult};
use crate::log::{PersistCompletion, PersistLog, SystemLog};
use crate::types::{EntryId, PersistHandle, ReplayOutcome, SectorType, SystemKey, SystemOp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    sector: SectorType,
    data: Vec<u8>,
}

#[derive(Debug)]
enum PendingOp {
    Write {
        entry_id: EntryId,
        sector: SectorType,
        data: Vec<u8>,
    },
    Modify {
        entry_id: EntryId,
        data: Vec<u8>,
    },
    Delete {
        entry_id: EntryId,
    },
}

#[derive(Debug)]
struct OpenTransaction {
    handle: PersistHandle,
    ops: Vec<PendingOp>,
}

impl OpenTransaction {
    /// Whether `entry_id` is live once the pending ops are applied on top of
    /// `committed`.
    fn resolves(&self, committed: bool, entry_id: EntryId) -> bool {
        self.ops.iter().fold(committed, |live, op| match op {
            PendingOp::Write { entry_id: id, .. } if *id == entry_id => true,
            PendingOp::Delete { entry_id: id } if *id == entry_id => false,
            _ => live,
        })
    }
}

#[derive(Debug)]
struct LogState {
    committed: BTreeMap<EntryId, StoredRecord>,
    open: Option<OpenTransaction>,
    next_entry: u64,
    next_handle: u64,
    last_outcome: ReplayOutcome,
    replay_override: Option<ReplayOutcome>,
    commits: u64,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            committed: BTreeMap::new(),
            open: None,
            next_entry: 1,
            next_handle: 1,
            last_outcome: ReplayOutcome::Unknown,
            replay_override: None,
            commits: 0,
        }
    }
}

impl LogState {
    fn open_mut(&mut self, handle: PersistHandle) -> PersistResult<&mut OpenTransaction> {
        match self.open.as_mut() {
            Some(open) if open.handle == handle => Ok(open),
            _ => Err(PersistError::InvalidHandle { handle }),
        }
    }

    fn take_open(&mut self, handle: PersistHandle) -> PersistResult<OpenTransaction> {
        match self.open.take() {
            Some(open) if open.handle == handle => Ok(open),
            other => {
                self.open = other;
                Err(PersistError::InvalidHandle { handle })
            }
        }
    }

    fn is_live(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<bool> {
        let committed = self.committed.contains_key(&entry_id);
        match self.open.as_ref() {
            Some(open) if open.handle == handle => Ok(open.resolves(committed, entry_id)),
            _ => Err(PersistError::InvalidHandle { handle }),
        }
    }

    fn apply(&mut self, ops: Vec<PendingOp>) {
        for op in ops {
            match op {
                PendingOp::Write {
                    entry_id,
                    sector,
                    data,
                } => {
                    self.committed.insert(entry_id, StoredRecord { sector, data });
                }
                PendingOp::Modify { entry_id, data } => {
                    if let Some(record) = self.committed.get_mut(&entry_id) {
                        record.data = data;
                    }
                }
                PendingOp::Delete { entry_id } => {
                    self.committed.remove(&entry_id);
                }
            }
        }
    }
}

/// An in-memory general persistence log.
///
/// Entry ids are allocated at write time and never reused. Completions are
/// invoked on the calling thread before `commit_transaction` returns.
///
/// # Example
///
/// ```rust
/// use duplexdb_persist::{InMemoryPersistLog, PersistLog, SectorType};
///
/// let log = InMemoryPersistLog::new();
/// let handle = log.start_transaction().unwrap();
/// let id = log.write_entry(handle, SectorType::Objects, b"cfg").unwrap();
/// log.commit_transaction(handle, Box::new(|result| assert!(result.is_ok())));
/// assert_eq!(log.record(id), Some(b"cfg".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPersistLog {
    state: RwLock<LogState>,
}

impl InMemoryPersistLog {
    /// Creates a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed record at `entry_id`.
    #[must_use]
    pub fn record(&self, entry_id: EntryId) -> Option<Vec<u8>> {
        self.state
            .read()
            .committed
            .get(&entry_id)
            .map(|r| r.data.clone())
    }

    /// Returns the number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().committed.len()
    }

    /// Returns true if the log holds no committed records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a transaction is open.
    #[must_use]
    pub fn has_open_transaction(&self) -> bool {
        self.state.read().open.is_some()
    }

    /// Returns how many transactions have committed.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.read().commits
    }

    /// Forces the outcome reported by the next replays.
    ///
    /// Useful for testing recovery decisions.
    pub fn set_replay_outcome(&self, outcome: Option<ReplayOutcome>) {
        self.state.write().replay_override = outcome;
    }
}

impl PersistLog for InMemoryPersistLog {
    fn start_transaction(&self) -> PersistResult<PersistHandle> {
        let mut state = self.state.write();
        if state.open.is_some() {
            return Err(PersistError::Busy);
        }
        let handle = PersistHandle::new(state.next_handle);
        state.next_handle += 1;
        state.open = Some(OpenTransaction {
            handle,
            ops: Vec::new(),
        });
        Ok(handle)
    }

    fn write_entry(
        &self,
        handle: PersistHandle,
        sector: SectorType,
        data: &[u8],
    ) -> PersistResult<EntryId> {
        let mut state = self.state.write();
        let entry_id = EntryId::new(state.next_entry);
        state.open_mut(handle)?.ops.push(PendingOp::Write {
            entry_id,
            sector,
            data: data.to_vec(),
        });
        state.next_entry += 1;
        Ok(entry_id)
    }

    fn modify_entry(
        &self,
        handle: PersistHandle,
        data: &[u8],
        entry_id: EntryId,
    ) -> PersistResult<()> {
        let mut state = self.state.write();
        if !state.is_live(handle, entry_id)? {
            return Err(PersistError::EntryNotFound { entry_id });
        }
        state.open_mut(handle)?.ops.push(PendingOp::Modify {
            entry_id,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn delete_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<()> {
        let mut state = self.state.write();
        if !state.is_live(handle, entry_id)? {
            return Err(PersistError::EntryNotFound { entry_id });
        }
        state
            .open_mut(handle)?
            .ops
            .push(PendingOp::Delete { entry_id });
        Ok(())
    }

    fn commit_transaction(&self, handle: PersistHandle, completion: PersistCompletion) {
        let result = {
            let mut state = self.state.write();
            match state.take_open(handle) {
                Ok(open) => {
                    let count = open.ops.len();
                    state.apply(open.ops);
                    state.commits += 1;
                    state.last_outcome = ReplayOutcome::Committed;
                    debug!(%handle, ops = count, "log transaction committed");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        completion(result);
    }

    fn abort_transaction(&self, handle: PersistHandle, completion: PersistCompletion) {
        let result = {
            let mut state = self.state.write();
            state.take_open(handle).map(|_| {
                state.last_outcome = ReplayOutcome::NotCommitted;
                debug!(%handle, "log transaction aborted");
            })
        };
        completion(result);
    }

    fn validate_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<bool> {
        self.state.read().is_live(handle, entry_id)
    }

    fn read_sector(&self, sector: SectorType) -> PersistResult<Vec<(EntryId, Vec<u8>)>> {
        Ok(self
            .state
            .read()
            .committed
            .iter()
            .filter(|(_, record)| record.sector == sector)
            .map(|(id, record)| (*id, record.data.clone()))
            .collect())
    }

    fn replay(&self) -> ReplayOutcome {
        let mut state = self.state.write();
        if let Some(open) = state.open.take() {
            debug!(handle = %open.handle, "replay discarded an unfinished log transaction");
            state.last_outcome = ReplayOutcome::NotCommitted;
        }
        state.replay_override.unwrap_or(state.last_outcome)
    }
}

#[derive(Debug, Default)]
struct SystemState {
    committed: BTreeMap<SystemKey, Vec<u8>>,
    open: Option<(PersistHandle, Vec<(SystemOp, SystemKey, Vec<u8>)>)>,
    next_handle: u64,
    commits: u64,
}

/// An in-memory system-objects log.
#[derive(Debug, Default)]
pub struct InMemorySystemLog {
    state: RwLock<SystemState>,
}

impl InMemorySystemLog {
    /// Creates a new empty system log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of committed system records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().committed.len()
    }

    /// Returns true if the log holds no committed records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a transaction is open.
    #[must_use]
    pub fn has_open_transaction(&self) -> bool {
        self.state.read().open.is_some()
    }

    /// Returns how many transactions have committed.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.read().commits
    }
}

impl SystemLog for InMemorySystemLog {
    fn start_transaction(&self) -> PersistResult<PersistHandle> {
        let mut state = self.state.write();
        if state.open.is_some() {
            return Err(PersistError::Busy);
        }
        state.next_handle += 1;
        let handle = PersistHandle::new(state.next_handle);
        state.open = Some((handle, Vec::new()));
        Ok(handle)
    }

    fn persist_entry(
        &self,
        handle: PersistHandle,
        op: SystemOp,
        key: SystemKey,
        data: &[u8],
    ) -> PersistResult<EntryId> {
        let mut state = self.state.write();
        match state.open.as_mut() {
            Some((open, ops)) if *open == handle => {
                ops.push((op, key, data.to_vec()));
                Ok(key.entry_id())
            }
            _ => Err(PersistError::InvalidHandle { handle }),
        }
    }

    fn commit_transaction(&self, handle: PersistHandle) -> PersistResult<()> {
        let mut state = self.state.write();
        let ops = match state.open.take() {
            Some((open, ops)) if open == handle => ops,
            other => {
                state.open = other;
                return Err(PersistError::InvalidHandle { handle });
            }
        };
        for (op, key, data) in ops {
            match op {
                SystemOp::Create | SystemOp::Update => {
                    state.committed.insert(key, data);
                }
                SystemOp::Delete => {
                    state.committed.remove(&key);
                }
            }
        }
        state.commits += 1;
        Ok(())
    }

    fn abort_transaction(&self, handle: PersistHandle) -> PersistResult<()> {
        let mut state = self.state.write();
        match state.open.take() {
            Some((open, _)) if open == handle => Ok(()),
            other => {
                state.open = other;
                Err(PersistError::InvalidHandle { handle })
            }
        }
    }

    fn read(&self, key: SystemKey) -> PersistResult<Option<Vec<u8>>> {
        Ok(self.state.read().committed.get(&key).cloned())
    }

    fn replay(&self) {
        if let Some((handle, _)) = self.state.write().open.take() {
            debug!(%handle, "replay discarded an unfinished system-log transaction");
        }
    }
}
