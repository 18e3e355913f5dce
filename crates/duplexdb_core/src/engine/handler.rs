//! Responder side of peer replication.
//!
//! The passive controller mirrors each step of the active controller's
//! transaction in memory. It never touches the logs; the active controller
//! owns durability. Every request is answered with a confirmation, even when
//! it is refused.

use super::Engine;
use crate::codec::from_cbor;
use crate::entry::{EdgeLink, Entry, GlobalInfo, ObjectConfig, Persistable, UserRecord};
use crate::error::{DatabaseError, DatabaseResult};
use crate::transaction::{Direction, TakenTransaction, Transaction, TransactionInfo};
use crate::types::{
    JobNumber, ServiceState, TableKind, TransactionId, TransactionState, TransactionType,
};
use duplexdb_peer::{
    ConfirmStatus, EntryIdMap, InboundHandler, MemoryDescriptor, PeerBody, PeerMessage,
    PeerOperation, PeerRequest, StagedRecord, TransactionBackup, TransactionSummary,
    VersionHeader,
};
use tracing::{debug, info, warn};

impl InboundHandler for Engine {
    fn on_message(&self, data: &[u8]) {
        let message = match PeerMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable peer message dropped");
                return;
            }
        };
        match message.body {
            PeerBody::Confirm { operation, status } => {
                self.peer.complete(message.request_id, operation, status);
            }
            PeerBody::Request(request) => {
                let operation = request.operation;
                let status = self.handle_request(&message.header, request);
                self.peer.reply(message.request_id, operation, status);
            }
        }
    }

    fn on_memory(&self, descriptor: MemoryDescriptor) {
        match TransactionBackup::decode(&descriptor.data) {
            Ok(backup) => {
                debug!(txn = backup.transaction_id, ids = backup.entry_ids.placed(), "transaction backup received");
                *self.backup.lock() = Some(backup);
            }
            Err(e) => warn!(error = %e, "transaction backup undecodable"),
        }
        self.on_message(&descriptor.message);
    }
}

impl Engine {
    fn handle_request(&self, header: &VersionHeader, request: PeerRequest) -> ConfirmStatus {
        let operation = request.operation;
        let supported = self.config.max_message_size;
        if header.size > supported {
            warn!(%operation, declared = header.size, supported, "peer message larger than supported");
            return ConfirmStatus::LargerMessageSize { supported };
        }
        if self.service_state() != ServiceState::Ready {
            debug!(%operation, "service initializing, peer request ignored");
            return ConfirmStatus::Ok;
        }

        let result = match operation {
            PeerOperation::Start => {
                self.mirror_start(&request.summary);
                Ok(())
            }
            PeerOperation::Stage => self.mirror_stage(&request),
            PeerOperation::Commit | PeerOperation::CommitDma => self.mirror_commit(&request),
            PeerOperation::Abort => self.mirror_abort(&request.summary),
            PeerOperation::Invalidate => self.mirror_invalidate(&request.summary),
        };
        match result {
            Ok(()) => ConfirmStatus::Ok,
            Err(DatabaseError::ProtocolMismatch { local_job, .. }) => {
                ConfirmStatus::MismatchedTransaction { local_job }
            }
            Err(DatabaseError::VersionMismatch { supported, .. }) => {
                ConfirmStatus::LargerMessageSize { supported }
            }
            Err(e) => {
                warn!(%operation, error = %e, "peer request failed");
                ConfirmStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn mirror_start(&self, summary: &TransactionSummary) {
        let info = TransactionInfo {
            transaction_type: TransactionType::from_byte(summary.transaction_type)
                .unwrap_or_default(),
            job_number: JobNumber(summary.job_number),
        };
        let txn = self
            .manager
            .begin_with_id(TransactionId(summary.transaction_id), info);
        debug!(txn = %txn.id(), job = %info.job_number, "mirrored start");
    }

    fn mirror_stage(&self, request: &PeerRequest) -> DatabaseResult<()> {
        let record = request
            .staged
            .as_ref()
            .ok_or_else(|| DatabaseError::invalid_entry("stage request without an entry"))?;
        let mut txn = self.manager.take_in(&[TransactionState::Active])?;
        same_job(&txn, PeerOperation::Stage, &request.summary)?;
        match TableKind::from_byte(record.table) {
            Some(TableKind::Object) => self.mirror_entry::<ObjectConfig>(&mut txn, record),
            Some(TableKind::User) => self.mirror_entry::<UserRecord>(&mut txn, record),
            Some(TableKind::Edge) => self.mirror_entry::<EdgeLink>(&mut txn, record),
            Some(TableKind::GlobalInfo) => self.mirror_entry::<GlobalInfo>(&mut txn, record),
            None => Err(DatabaseError::invalid_entry(format!(
                "unknown table {}",
                record.table
            ))),
        }
    }

    fn mirror_entry<P: Persistable>(
        &self,
        txn: &mut Transaction,
        record: &StagedRecord,
    ) -> DatabaseResult<()> {
        let entry: Entry<P> = from_cbor(&record.bytes)?;
        if entry.header.version_size > P::LAYOUT_SIZE {
            warn!(table = %P::TABLE, declared = entry.header.version_size, supported = P::LAYOUT_SIZE, "peer entry layout larger than supported");
            return Err(DatabaseError::VersionMismatch {
                declared: entry.header.version_size,
                supported: P::LAYOUT_SIZE,
            });
        }
        let slot = usize::try_from(record.slot)
            .map_err(|_| DatabaseError::invalid_entry("slot index out of range"))?;
        self.stage_local(txn, entry, Some(slot))?;
        debug!(txn = %txn.id(), table = %P::TABLE, slot, "mirrored stage");
        Ok(())
    }

    /// Folds the peer's commit into memory, keeping the slot until the
    /// matching Invalidate arrives.
    fn mirror_commit(&self, request: &PeerRequest) -> DatabaseResult<()> {
        let operation = request.operation;
        let mut txn = self
            .manager
            .take_in(&[TransactionState::Active, TransactionState::Commit])?;
        same_job(&txn, operation, &request.summary)?;

        let entry_ids = if operation == PeerOperation::CommitDma {
            let backup = self
                .backup
                .lock()
                .take()
                .ok_or_else(|| DatabaseError::not_found("transaction backup"))?;
            if backup.transaction_id != txn.id().as_u64() {
                return Err(DatabaseError::invalid_entry(format!(
                    "backup belongs to transaction {}",
                    backup.transaction_id
                )));
            }
            backup.entry_ids
        } else {
            request.summary.entry_ids.clone()
        };

        self.fold_commit(&mut txn, &entry_ids, operation);
        Ok(())
    }

    fn fold_commit(
        &self,
        txn: &mut TakenTransaction<'_>,
        entry_ids: &EntryIdMap,
        operation: PeerOperation,
    ) {
        txn.adopt_entry_ids(entry_ids);
        txn.set_state(TransactionState::Commit);
        let report = self.walk(txn, Direction::Commit, None);
        debug!(txn = %txn.id(), %operation, applied = report.applied, failed = report.failed, "mirrored commit");
    }

    fn mirror_abort(&self, summary: &TransactionSummary) -> DatabaseResult<()> {
        let txn = match self.manager.take_any() {
            Some(txn) if txn.state() != TransactionState::Inactive => txn,
            _ => return Ok(()),
        };
        same_job(&txn, PeerOperation::Abort, summary)?;
        let id = txn.id();
        let report = self.revert_in_memory(txn);
        info!(txn = %id, reverted = report.applied, tolerated = report.tolerated, "mirrored abort");
        Ok(())
    }

    /// Releases the mirrored slot. A slot still `ACTIVE` missed the
    /// Commit; the peer only invalidates after its logs committed, so the
    /// commit is folded first.
    fn mirror_invalidate(&self, summary: &TransactionSummary) -> DatabaseResult<()> {
        let Some(mut txn) = self.manager.take_any() else {
            return Ok(());
        };
        same_job(&txn, PeerOperation::Invalidate, summary)?;
        if txn.state() == TransactionState::Active {
            warn!(txn = %txn.id(), "invalidate without a mirrored commit, folding it now");
            self.fold_commit(&mut txn, &summary.entry_ids, PeerOperation::Invalidate);
        }
        debug!(txn = %txn.id(), "mirrored transaction released");
        txn.finish();
        Ok(())
    }
}

/// Refuses a request whose job differs from the local transaction's.
fn same_job(
    txn: &Transaction,
    operation: PeerOperation,
    summary: &TransactionSummary,
) -> DatabaseResult<()> {
    let local_job = txn.job_number().as_u64();
    if local_job == summary.job_number {
        Ok(())
    } else {
        Err(DatabaseError::ProtocolMismatch {
            operation,
            local_job,
            remote_job: summary.job_number,
        })
    }
}
