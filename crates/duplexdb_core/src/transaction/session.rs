//! A pair of open log transactions.

use crate::completion::{completion, Waited};
use crate::error::{DatabaseError, DatabaseResult};
use duplexdb_persist::{
    EntryId, PersistHandle, PersistLog, PersistResult, SectorType, SystemKey, SystemLog, SystemOp,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Busy-retry policy for opening a log transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BusyRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl BusyRetry {
    fn run<T>(self, what: &str, mut op: impl FnMut() -> PersistResult<T>) -> DatabaseResult<T> {
        let attempts = self.attempts.max(1);
        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy() => {
                    debug!(log = what, attempt, "log busy");
                    if attempt < attempts {
                        std::thread::sleep(self.delay);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(log = what, attempts, "log stayed busy");
        Err(DatabaseError::Busy { attempts })
    }
}

/// Open transactions on the system log and, unless system-only, the
/// general log.
///
/// Dropping a session aborts whatever is still open, except while
/// unwinding from a panic: a crashed writer leaves its log transactions for
/// replay to discard.
pub(crate) struct LogSession<'a> {
    persist: &'a dyn PersistLog,
    system: &'a dyn SystemLog,
    general: Option<PersistHandle>,
    system_handle: Option<PersistHandle>,
}

impl<'a> LogSession<'a> {
    /// Opens both logs, system first.
    pub(crate) fn open(
        persist: &'a dyn PersistLog,
        system: &'a dyn SystemLog,
        retry: BusyRetry,
    ) -> DatabaseResult<Self> {
        let mut session = Self::open_system_only(persist, system, retry)?;
        session.general = Some(retry.run("general", || persist.start_transaction())?);
        Ok(session)
    }

    /// Opens only the system log. General-log writes are skipped.
    pub(crate) fn open_system_only(
        persist: &'a dyn PersistLog,
        system: &'a dyn SystemLog,
        retry: BusyRetry,
    ) -> DatabaseResult<Self> {
        let handle = retry.run("system", || system.start_transaction())?;
        Ok(Self {
            persist,
            system,
            general: None,
            system_handle: Some(handle),
        })
    }

    /// Returns true if general-log writes go anywhere.
    pub(crate) fn has_general(&self) -> bool {
        self.general.is_some()
    }

    fn general_handle(&self) -> DatabaseResult<PersistHandle> {
        self.general
            .ok_or_else(|| DatabaseError::persist_failure("general log is not open"))
    }

    fn system_handle(&self) -> DatabaseResult<PersistHandle> {
        self.system_handle
            .ok_or_else(|| DatabaseError::persist_failure("system log is not open"))
    }

    pub(crate) fn write(&self, sector: SectorType, data: &[u8]) -> DatabaseResult<EntryId> {
        Ok(self.persist.write_entry(self.general_handle()?, sector, data)?)
    }

    pub(crate) fn modify(&self, entry_id: EntryId, data: &[u8]) -> DatabaseResult<()> {
        Ok(self.persist.modify_entry(self.general_handle()?, data, entry_id)?)
    }

    pub(crate) fn delete(&self, entry_id: EntryId) -> DatabaseResult<()> {
        Ok(self.persist.delete_entry(self.general_handle()?, entry_id)?)
    }

    pub(crate) fn validate(&self, entry_id: EntryId) -> DatabaseResult<bool> {
        Ok(self.persist.validate_entry(self.general_handle()?, entry_id)?)
    }

    /// Returns the committed general-log records of a sector.
    pub(crate) fn read_sector(&self, sector: SectorType) -> DatabaseResult<Vec<(EntryId, Vec<u8>)>> {
        Ok(self.persist.read_sector(sector)?)
    }

    pub(crate) fn system_persist(
        &self,
        op: SystemOp,
        key: SystemKey,
        data: &[u8],
    ) -> DatabaseResult<EntryId> {
        Ok(self.system.persist_entry(self.system_handle()?, op, key, data)?)
    }

    /// Commits the general log, blocking until it reports.
    pub(crate) fn commit_general(&mut self) -> DatabaseResult<()> {
        self.commit_general_inner(None)
    }

    /// Commits the general log, waiting at most `timeout`.
    pub(crate) fn commit_general_within(&mut self, timeout: Duration) -> DatabaseResult<()> {
        self.commit_general_inner(Some(timeout))
    }

    fn commit_general_inner(&mut self, timeout: Option<Duration>) -> DatabaseResult<()> {
        let Some(handle) = self.general.take() else {
            return Ok(());
        };
        let (completer, done) = completion();
        self.persist
            .commit_transaction(handle, Box::new(move |result| completer.complete(result)));
        let outcome = match timeout {
            None => done.wait(),
            Some(timeout) => match done.wait_timeout(timeout) {
                Waited::Ready(result) => Some(result),
                Waited::TimedOut => return Err(DatabaseError::timeout("general log commit")),
                Waited::Abandoned => None,
            },
        };
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(DatabaseError::persist_failure(e.to_string())),
            None => Err(DatabaseError::persist_failure(
                "general log dropped its commit completion",
            )),
        }
    }

    /// Commits the system log.
    pub(crate) fn commit_system(&mut self) -> DatabaseResult<()> {
        let Some(handle) = self.system_handle.take() else {
            return Ok(());
        };
        self.system
            .commit_transaction(handle)
            .map_err(|e| DatabaseError::persist_failure(e.to_string()))
    }

    /// Aborts whatever is still open.
    pub(crate) fn abort(&mut self) {
        if let Some(handle) = self.general.take() {
            let (completer, done) = completion();
            self.persist
                .abort_transaction(handle, Box::new(move |result| completer.complete(result)));
            if let Some(Err(e)) = done.wait() {
                warn!(%handle, error = %e, "general log abort failed");
            }
        }
        if let Some(handle) = self.system_handle.take() {
            if let Err(e) = self.system.abort_transaction(handle) {
                warn!(%handle, error = %e, "system log abort failed");
            }
        }
    }
}

impl Drop for LogSession<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplexdb_persist::{InMemoryPersistLog, InMemorySystemLog};

    const RETRY: BusyRetry = BusyRetry {
        attempts: 3,
        delay: Duration::from_millis(1),
    };

    #[test]
    fn open_and_commit_both_logs() {
        let persist = InMemoryPersistLog::new();
        let system = InMemorySystemLog::new();
        let mut session = LogSession::open(&persist, &system, RETRY).unwrap();
        let id = session.write(SectorType::Objects, b"pool").unwrap();
        session
            .system_persist(SystemOp::Create, SystemKey::new(SectorType::Objects, 1, 0), b"vault")
            .unwrap();
        session.commit_general().unwrap();
        session.commit_system().unwrap();
        drop(session);

        assert_eq!(persist.record(id), Some(b"pool".to_vec()));
        assert_eq!(system.len(), 1);
    }

    #[test]
    fn busy_log_gives_up_after_retries() {
        let persist = InMemoryPersistLog::new();
        let system = InMemorySystemLog::new();
        let _holder = persist.start_transaction().unwrap();

        let result = LogSession::open(&persist, &system, RETRY);
        assert!(matches!(result, Err(DatabaseError::Busy { attempts: 3 })));
        // The system half was aborted when the session was dropped.
        assert!(!system.has_open_transaction());
    }

    #[test]
    fn drop_aborts_open_logs() {
        let persist = InMemoryPersistLog::new();
        let system = InMemorySystemLog::new();
        {
            let session = LogSession::open(&persist, &system, RETRY).unwrap();
            session.write(SectorType::Users, b"x").unwrap();
        }
        assert!(!persist.has_open_transaction());
        assert!(!system.has_open_transaction());
        assert!(persist.is_empty());
    }

    #[test]
    fn system_only_session_skips_general() {
        let persist = InMemoryPersistLog::new();
        let system = InMemorySystemLog::new();
        let mut session = LogSession::open_system_only(&persist, &system, RETRY).unwrap();
        assert!(!session.has_general());
        assert!(session.write(SectorType::Objects, b"x").is_err());
        session.commit_general().unwrap();
        session.commit_system().unwrap();
        assert!(!persist.has_open_transaction());
    }
}
