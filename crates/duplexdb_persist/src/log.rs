//! Persistence log contracts.

use crate::error::PersistResult;
use crate::types::{EntryId, PersistHandle, ReplayOutcome, SectorType, SystemKey, SystemOp};

/// Callback fired when a log transaction finishes committing or aborting.
pub type PersistCompletion = Box<dyn FnOnce(PersistResult<()>) + Send + 'static>;

/// The general-objects persistence log.
///
/// The log is a transactional store of opaque records. A transaction is
/// opened with [`start_transaction`](Self::start_transaction), receives
/// writes, modifies and deletes against its handle, and is finished by
/// [`commit_transaction`](Self::commit_transaction) or
/// [`abort_transaction`](Self::abort_transaction). Finishing is asynchronous:
/// the outcome is delivered to the supplied completion.
///
/// # Invariants
///
/// - At most one transaction is open at a time; a second start is `Busy`
/// - `write_entry` assigns a nonzero entry id at call time
/// - Nothing written under a handle is visible to [`read_sector`](Self::read_sector)
///   until the transaction commits
/// - Implementations must be `Send + Sync`; both controllers share one log
///
/// # Implementors
///
/// - [`super::InMemoryPersistLog`] - For testing and simulation
pub trait PersistLog: Send + Sync {
    /// Opens a log transaction.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Busy` if another transaction is open.
    fn start_transaction(&self) -> PersistResult<PersistHandle>;

    /// Writes a new record and returns the id it will live at.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not the open transaction.
    fn write_entry(
        &self,
        handle: PersistHandle,
        sector: SectorType,
        data: &[u8],
    ) -> PersistResult<EntryId>;

    /// Overwrites the record at `entry_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is invalid or no record exists at `entry_id`.
    fn modify_entry(&self, handle: PersistHandle, data: &[u8], entry_id: EntryId)
        -> PersistResult<()>;

    /// Deletes the record at `entry_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is invalid or no record exists at `entry_id`.
    fn delete_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<()>;

    /// Commits the transaction, reporting the outcome to `completion`.
    fn commit_transaction(&self, handle: PersistHandle, completion: PersistCompletion);

    /// Aborts the transaction, reporting the outcome to `completion`.
    fn abort_transaction(&self, handle: PersistHandle, completion: PersistCompletion);

    /// Returns true if a record currently lives at `entry_id`.
    ///
    /// Pending operations under `handle` are taken into account.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not the open transaction.
    fn validate_entry(&self, handle: PersistHandle, entry_id: EntryId) -> PersistResult<bool>;

    /// Returns every committed record of a sector.
    ///
    /// # Errors
    ///
    /// Returns an error if the sector cannot be read.
    fn read_sector(&self, sector: SectorType) -> PersistResult<Vec<(EntryId, Vec<u8>)>>;

    /// Runs crash replay and reports whether the most recent transaction
    /// reached its commit point.
    ///
    /// A transaction left open by a writer that died is discarded.
    fn replay(&self) -> ReplayOutcome;
}

/// The system-objects log.
///
/// Narrower than [`PersistLog`]: records live at fixed [`SystemKey`]
/// locations and the log commits synchronously. It is expected to commit
/// and abort in lockstep with the general log.
pub trait SystemLog: Send + Sync {
    /// Opens a system-log transaction.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Busy` if another transaction is open.
    fn start_transaction(&self) -> PersistResult<PersistHandle>;

    /// Applies one operation to the record at `key`.
    ///
    /// `Create` and `Update` both store `data`; `Delete` of a missing record
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not the open transaction.
    fn persist_entry(
        &self,
        handle: PersistHandle,
        op: SystemOp,
        key: SystemKey,
        data: &[u8],
    ) -> PersistResult<EntryId>;

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is invalid or the commit fails.
    fn commit_transaction(&self, handle: PersistHandle) -> PersistResult<()>;

    /// Aborts the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is invalid.
    fn abort_transaction(&self, handle: PersistHandle) -> PersistResult<()>;

    /// Reads the committed record at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn read(&self, key: SystemKey) -> PersistResult<Option<Vec<u8>>>;

    /// Discards a transaction left open by a writer that died.
    fn replay(&self);
}
