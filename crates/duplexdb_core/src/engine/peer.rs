//! Requester side of peer replication.
//!
//! Every replicated step is a request followed by two waits: one for the
//! transport to acknowledge the send, one for the peer to confirm it acted.
//! Both waits are sliced so a peer that dies mid-wait ends the wait early;
//! a dead or absent peer counts as success.

use crate::completion::{completion, Completer, Completion, Waited};
use crate::config::EngineConfig;
use crate::error::{DatabaseError, DatabaseResult};
use bytes::Bytes;
use duplexdb_peer::{
    ConfirmStatus, MemoryDescriptor, MemoryRegion, PeerBody, PeerChannel, PeerMessage,
    PeerOperation, PeerRequest, SendCompletion, SendStatus, TransactionBackup,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub(crate) struct PeerLink {
    channel: Option<Arc<dyn PeerChannel>>,
    pending: Mutex<HashMap<Uuid, Completer<ConfirmStatus>>>,
    ack_timeout: Duration,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl PeerLink {
    pub(crate) fn new(channel: Option<Arc<dyn PeerChannel>>, config: &EngineConfig) -> Self {
        Self {
            channel,
            pending: Mutex::new(HashMap::new()),
            ack_timeout: config.peer_ack_timeout,
            confirm_timeout: config.peer_confirm_timeout,
            poll_interval: config.peer_poll_interval,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub(crate) fn is_peer_alive(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.is_peer_alive())
    }

    /// Address of the peer's backup region, if bulk transfer is possible.
    pub(crate) fn backup_address(&self) -> Option<u64> {
        self.channel
            .as_ref()
            .and_then(|channel| channel.translate_address(MemoryRegion::TransactionBackup))
    }

    /// Sends `request` and waits until the peer confirms it.
    pub(crate) fn round_trip(&self, request: PeerRequest) -> DatabaseResult<()> {
        let Some(channel) = self.channel.as_deref() else {
            return Ok(());
        };
        let message = PeerMessage::request(request)?;
        let bytes = Bytes::from(message.encode()?);
        self.exchange(channel, &message, |done| channel.send(bytes, done))
    }

    /// Copies `backup` into the peer's backup region, then sends `request`
    /// and waits until the peer confirms it.
    pub(crate) fn round_trip_memory(
        &self,
        request: PeerRequest,
        backup: &TransactionBackup,
        peer_address: u64,
    ) -> DatabaseResult<()> {
        let Some(channel) = self.channel.as_deref() else {
            return Ok(());
        };
        let message = PeerMessage::request(request)?;
        let descriptor = MemoryDescriptor {
            region: MemoryRegion::TransactionBackup,
            peer_address,
            data: Bytes::from(backup.encode()?),
            message: Bytes::from(message.encode()?),
        };
        self.exchange(channel, &message, |done| channel.send_memory(descriptor, done))
    }

    fn exchange(
        &self,
        channel: &dyn PeerChannel,
        message: &PeerMessage,
        send: impl FnOnce(SendCompletion),
    ) -> DatabaseResult<()> {
        let (confirm_tx, confirm) = completion();
        self.pending.lock().insert(message.request_id, confirm_tx);
        let result = self.await_confirm(channel, message, send, &confirm);
        self.pending.lock().remove(&message.request_id);
        result
    }

    fn await_confirm(
        &self,
        channel: &dyn PeerChannel,
        message: &PeerMessage,
        send: impl FnOnce(SendCompletion),
        confirm: &Completion<ConfirmStatus>,
    ) -> DatabaseResult<()> {
        let operation = message.operation();
        let (ack_tx, ack) = completion();
        send(Box::new(move |status| ack_tx.complete(status)));

        match self.wait_while_alive(channel, &ack, self.ack_timeout) {
            Waited::Ready(SendStatus::Delivered) => {}
            Waited::Ready(SendStatus::NoDevice) => {
                debug!(%operation, "peer not present");
                return Ok(());
            }
            Waited::Ready(SendStatus::Failed(reason)) => {
                return self.unless_peer_gone(channel, operation, || {
                    DatabaseError::peer_failure(operation, reason)
                });
            }
            Waited::TimedOut | Waited::Abandoned => {
                return self.unless_peer_gone(channel, operation, || {
                    DatabaseError::timeout(format!("{operation} acknowledgement"))
                });
            }
        }

        match self.wait_while_alive(channel, confirm, self.confirm_timeout) {
            Waited::Ready(status) => {
                trace!(%operation, ?status, "peer confirmed");
                confirm_result(operation, message, status)
            }
            Waited::TimedOut | Waited::Abandoned => self.unless_peer_gone(channel, operation, || {
                DatabaseError::timeout(format!("{operation} confirmation"))
            }),
        }
    }

    /// Waits up to `timeout`, giving up early once the peer is gone.
    fn wait_while_alive<T>(
        &self,
        channel: &dyn PeerChannel,
        completion: &Completion<T>,
        timeout: Duration,
    ) -> Waited<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Waited::TimedOut;
            }
            match completion.wait_timeout(remaining.min(self.poll_interval)) {
                Waited::TimedOut if channel.is_peer_alive() => {}
                other => return other,
            }
        }
    }

    fn unless_peer_gone(
        &self,
        channel: &dyn PeerChannel,
        operation: PeerOperation,
        error: impl FnOnce() -> DatabaseError,
    ) -> DatabaseResult<()> {
        if channel.is_peer_alive() {
            Err(error())
        } else {
            debug!(%operation, "peer died during exchange");
            Ok(())
        }
    }

    /// Routes an inbound confirmation to its waiting requester.
    pub(crate) fn complete(&self, request_id: Uuid, operation: PeerOperation, status: ConfirmStatus) {
        match self.pending.lock().remove(&request_id) {
            Some(waiter) => waiter.complete(status),
            None => debug!(%request_id, %operation, "confirmation for no pending request"),
        }
    }

    /// Sends a confirmation back to the peer.
    pub(crate) fn reply(&self, request_id: Uuid, operation: PeerOperation, status: ConfirmStatus) {
        let Some(channel) = self.channel.as_deref() else {
            return;
        };
        let encoded = match PeerMessage::confirm(request_id, operation, status).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(%operation, error = %e, "confirmation not encodable");
                return;
            }
        };
        channel.send(
            Bytes::from(encoded),
            Box::new(move |status| {
                if let SendStatus::Failed(reason) = status {
                    warn!(%operation, %reason, "confirmation not delivered");
                }
            }),
        );
    }
}

fn confirm_result(
    operation: PeerOperation,
    message: &PeerMessage,
    status: ConfirmStatus,
) -> DatabaseResult<()> {
    match status {
        ConfirmStatus::Ok => Ok(()),
        ConfirmStatus::MismatchedTransaction { local_job } => {
            let job_number = match &message.body {
                PeerBody::Request(request) => request.summary.job_number,
                PeerBody::Confirm { .. } => 0,
            };
            Err(DatabaseError::ProtocolMismatch {
                operation,
                local_job: job_number,
                remote_job: local_job,
            })
        }
        ConfirmStatus::LargerMessageSize { supported } => Err(DatabaseError::VersionMismatch {
            declared: message.header.size,
            supported,
        }),
        ConfirmStatus::Failed { reason } => Err(DatabaseError::peer_failure(operation, reason)),
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplexdb_peer::TransactionSummary;

    /// Channel that acknowledges with a fixed status and never confirms.
    struct FixedChannel {
        ack: Option<SendStatus>,
        alive: bool,
    }

    impl PeerChannel for FixedChannel {
        fn send(&self, _message: Bytes, completion: SendCompletion) {
            if let Some(status) = self.ack.clone() {
                completion(status);
            } else {
                drop(completion);
            }
        }

        fn send_memory(&self, descriptor: MemoryDescriptor, completion: SendCompletion) {
            self.send(descriptor.message, completion);
        }

        fn is_peer_alive(&self) -> bool {
            self.alive
        }

        fn translate_address(&self, _region: MemoryRegion) -> Option<u64> {
            None
        }
    }

    fn link(ack: Option<SendStatus>, alive: bool) -> PeerLink {
        let config = EngineConfig::default()
            .peer_timeouts(Duration::from_millis(40), Duration::from_millis(40))
            .peer_poll_interval(Duration::from_millis(5));
        PeerLink::new(Some(Arc::new(FixedChannel { ack, alive })), &config)
    }

    fn request() -> PeerRequest {
        PeerRequest {
            operation: PeerOperation::Start,
            summary: TransactionSummary {
                transaction_id: 1,
                job_number: 12,
                ..TransactionSummary::default()
            },
            staged: None,
        }
    }

    #[test]
    fn unconnected_link_succeeds() {
        let link = PeerLink::new(None, &EngineConfig::default());
        assert!(!link.is_connected());
        link.round_trip(request()).unwrap();
    }

    #[test]
    fn no_device_is_success() {
        link(Some(SendStatus::NoDevice), false)
            .round_trip(request())
            .unwrap();
    }

    #[test]
    fn missing_ack_with_live_peer_times_out() {
        let err = link(None, true).round_trip(request()).unwrap_err();
        assert!(matches!(err, DatabaseError::Timeout { .. }));
    }

    #[test]
    fn missing_confirm_with_dead_peer_succeeds() {
        link(Some(SendStatus::Delivered), false)
            .round_trip(request())
            .unwrap();
    }

    #[test]
    fn transport_failure_with_live_peer_fails() {
        let err = link(Some(SendStatus::Failed("link down".into())), true)
            .round_trip(request())
            .unwrap_err();
        assert!(matches!(err, DatabaseError::PeerFailure { .. }));
    }

    #[test]
    fn mismatch_confirm_names_both_jobs() {
        let message = PeerMessage::request(request()).unwrap();
        assert!(matches!(message.body, PeerBody::Request(_)));
        let err = confirm_result(
            PeerOperation::Commit,
            &message,
            ConfirmStatus::MismatchedTransaction { local_job: 99 },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::ProtocolMismatch {
                local_job: 12,
                remote_job: 99,
                ..
            }
        ));
    }

    #[test]
    fn late_confirmation_is_ignored() {
        let link = link(Some(SendStatus::Delivered), true);
        link.complete(Uuid::new_v4(), PeerOperation::Start, ConfirmStatus::Ok);
        assert_eq!(link.pending.lock().len(), 0);
    }
}
