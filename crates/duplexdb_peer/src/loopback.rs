//! In-process peer link between two controllers.

use crate::channel::{
    InboundHandler, MemoryDescriptor, MemoryRegion, PeerChannel, SendCompletion, SendStatus,
};
use crate::message::{PeerMessage, PeerOperation};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, trace};

/// Address the loopback reports for the transaction backup region.
pub const BACKUP_REGION_ADDRESS: u64 = 0x0010_0000;

enum Delivery {
    Message {
        data: Bytes,
        completion: SendCompletion,
    },
    Memory {
        descriptor: MemoryDescriptor,
        completion: SendCompletion,
    },
}

/// Per-controller state of one end of the link.
struct Side {
    name: &'static str,
    alive: AtomicBool,
    silent: AtomicBool,
    unresponsive: AtomicBool,
    dma_enabled: AtomicBool,
    handler: RwLock<Option<Weak<dyn InboundHandler>>>,
    parked: Mutex<Vec<SendCompletion>>,
    sent: Mutex<Vec<PeerOperation>>,
}

impl Side {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            alive: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            dma_enabled: AtomicBool::new(true),
            handler: RwLock::new(None),
            parked: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Factory for a connected pair of [`LoopbackEndpoint`]s.
pub struct LoopbackLink;

impl LoopbackLink {
    /// Creates two endpoints wired to each other.
    ///
    /// Each direction is served by its own delivery thread, so a handler may
    /// send on its own endpoint while handling an inbound message.
    #[must_use]
    pub fn pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
        let a = Arc::new(Side::new("a"));
        let b = Arc::new(Side::new("b"));
        (
            LoopbackEndpoint::spawn(Arc::clone(&a), Arc::clone(&b)),
            LoopbackEndpoint::spawn(b, a),
        )
    }
}

/// One controller's end of a loopback link.
///
/// Besides carrying traffic it exposes fault knobs used by tests:
///
/// - [`set_alive`](Self::set_alive) - this controller is present or dead
/// - [`set_silent`](Self::set_silent) - inbound messages are acknowledged but dropped
/// - [`set_unresponsive`](Self::set_unresponsive) - outbound sends are never acknowledged
/// - [`set_dma_enabled`](Self::set_dma_enabled) - bulk transfer address translation
pub struct LoopbackEndpoint {
    local: Arc<Side>,
    remote: Arc<Side>,
    queue: Mutex<mpsc::Sender<Delivery>>,
}

impl LoopbackEndpoint {
    fn spawn(local: Arc<Side>, remote: Arc<Side>) -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>();
        let source = Arc::downgrade(&local);
        let target = Arc::downgrade(&remote);
        let name = format!("loopback-{}-to-{}", local.name, remote.name);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || deliver_loop(&rx, &source, &target));
        if let Err(e) = spawned {
            debug!(error = %e, "loopback delivery thread failed to start");
        }
        Self {
            local,
            remote,
            queue: Mutex::new(tx),
        }
    }

    /// Attaches the handler that receives this controller's inbound traffic.
    pub fn attach(&self, handler: Weak<dyn InboundHandler>) {
        *self.local.handler.write() = Some(handler);
    }

    /// Marks this controller present or dead.
    pub fn set_alive(&self, alive: bool) {
        self.local.alive.store(alive, Ordering::SeqCst);
        if !alive {
            self.release_parked();
        }
    }

    /// Returns true if this controller is present.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.local.alive.load(Ordering::SeqCst)
    }

    /// Drops inbound messages after acknowledging them.
    pub fn set_silent(&self, silent: bool) {
        self.local.silent.store(silent, Ordering::SeqCst);
    }

    /// Withholds acknowledgement of outbound sends.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.local.unresponsive.store(unresponsive, Ordering::SeqCst);
        if !unresponsive {
            self.release_parked();
        }
    }

    /// Enables or disables bulk transfer into this controller.
    pub fn set_dma_enabled(&self, enabled: bool) {
        self.local.dma_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Returns the operations sent from this endpoint, in order.
    #[must_use]
    pub fn sent_operations(&self) -> Vec<PeerOperation> {
        self.local.sent.lock().clone()
    }

    /// Forgets the record of sent operations.
    pub fn clear_sent(&self) {
        self.local.sent.lock().clear();
    }

    /// Fails parked completions; the transport gave up on them.
    fn release_parked(&self) {
        let parked: Vec<_> = self.local.parked.lock().drain(..).collect();
        for completion in parked {
            completion(SendStatus::NoDevice);
        }
    }

    fn record(&self, message: &[u8]) {
        if let Ok(decoded) = PeerMessage::decode(message) {
            self.local.sent.lock().push(decoded.operation());
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        if let Err(mpsc::SendError(delivery)) = self.queue.lock().send(delivery) {
            let completion = match delivery {
                Delivery::Message { completion, .. } | Delivery::Memory { completion, .. } => {
                    completion
                }
            };
            completion(SendStatus::Failed("loopback delivery thread stopped".into()));
        }
    }
}

impl std::fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("local", &self.local.name)
            .field("remote", &self.remote.name)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl PeerChannel for LoopbackEndpoint {
    fn send(&self, message: Bytes, completion: SendCompletion) {
        self.record(&message);
        self.enqueue(Delivery::Message {
            data: message,
            completion,
        });
    }

    fn send_memory(&self, descriptor: MemoryDescriptor, completion: SendCompletion) {
        self.record(&descriptor.message);
        self.enqueue(Delivery::Memory {
            descriptor,
            completion,
        });
    }

    fn is_peer_alive(&self) -> bool {
        self.remote.alive.load(Ordering::SeqCst)
    }

    fn translate_address(&self, region: MemoryRegion) -> Option<u64> {
        if !self.remote.dma_enabled.load(Ordering::SeqCst) {
            return None;
        }
        match region {
            MemoryRegion::TransactionBackup => Some(BACKUP_REGION_ADDRESS),
        }
    }
}

fn deliver_loop(rx: &mpsc::Receiver<Delivery>, source: &Weak<Side>, target: &Weak<Side>) {
    while let Ok(delivery) = rx.recv() {
        let (Some(source), Some(target)) = (source.upgrade(), target.upgrade()) else {
            return;
        };
        deliver(&source, &target, delivery);
    }
}

fn deliver(source: &Side, target: &Side, delivery: Delivery) {
    let (completion, inbound) = match delivery {
        Delivery::Message { data, completion } => (completion, Inbound::Message(data)),
        Delivery::Memory {
            descriptor,
            completion,
        } => (completion, Inbound::Memory(descriptor)),
    };

    if !source.alive.load(Ordering::SeqCst) || !target.alive.load(Ordering::SeqCst) {
        completion(SendStatus::NoDevice);
        return;
    }
    let Some(handler) = target.handler() else {
        completion(SendStatus::NoDevice);
        return;
    };

    if target.silent.load(Ordering::SeqCst) {
        trace!(to = target.name, "loopback dropped inbound traffic");
    } else {
        match inbound {
            Inbound::Message(data) => handler.on_message(&data),
            Inbound::Memory(descriptor) => handler.on_memory(descriptor),
        }
    }

    if source.unresponsive.load(Ordering::SeqCst) {
        source.parked.lock().push(completion);
    } else {
        completion(SendStatus::Delivered);
    }
}

enum Inbound {
    Message(Bytes),
    Memory(MemoryDescriptor),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ConfirmStatus, PeerRequest, TransactionSummary};
    use std::sync::mpsc::{sync_channel, SyncSender};
    use std::time::Duration;

    struct Recorder {
        tx: Mutex<SyncSender<String>>,
    }

    impl InboundHandler for Recorder {
        fn on_message(&self, data: &[u8]) {
            let op = PeerMessage::decode(data)
                .map(|m| m.operation().name().to_string())
                .unwrap_or_else(|_| "garbage".into());
            let _ = self.tx.lock().send(op);
        }

        fn on_memory(&self, descriptor: MemoryDescriptor) {
            let _ = self
                .tx
                .lock()
                .send(format!("memory:{}", descriptor.data.len()));
        }
    }

    fn start_message() -> Bytes {
        let msg = PeerMessage::request(PeerRequest {
            operation: PeerOperation::Start,
            summary: TransactionSummary::default(),
            staged: None,
        })
        .unwrap();
        Bytes::from(msg.encode().unwrap())
    }

    fn status_channel() -> (SendCompletion, mpsc::Receiver<SendStatus>) {
        let (tx, rx) = sync_channel(1);
        (
            Box::new(move |s| {
                let _ = tx.send(s);
            }),
            rx,
        )
    }

    #[test]
    fn loopback_delivers_and_acks() {
        let (a, b) = LoopbackLink::pair();
        let (tx, rx) = sync_channel(4);
        let recorder: Arc<dyn InboundHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.attach(Arc::downgrade(&recorder));

        let (completion, status) = status_channel();
        a.send(start_message(), completion);

        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::Delivered
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "start");
        assert_eq!(a.sent_operations(), vec![PeerOperation::Start]);
    }

    #[test]
    fn loopback_dead_peer_reports_no_device() {
        let (a, b) = LoopbackLink::pair();
        let (tx, _rx) = sync_channel(4);
        let recorder: Arc<dyn InboundHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.attach(Arc::downgrade(&recorder));
        b.set_alive(false);

        assert!(!a.is_peer_alive());
        let (completion, status) = status_channel();
        a.send(start_message(), completion);
        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::NoDevice
        );
    }

    #[test]
    fn loopback_unattached_peer_reports_no_device() {
        let (a, _b) = LoopbackLink::pair();
        let (completion, status) = status_channel();
        a.send(start_message(), completion);
        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::NoDevice
        );
    }

    #[test]
    fn loopback_unresponsive_parks_ack() {
        let (a, b) = LoopbackLink::pair();
        let (tx, _rx) = sync_channel(4);
        let recorder: Arc<dyn InboundHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.attach(Arc::downgrade(&recorder));
        a.set_unresponsive(true);

        let (completion, status) = status_channel();
        a.send(start_message(), completion);
        assert!(status.recv_timeout(Duration::from_millis(100)).is_err());

        a.set_unresponsive(false);
        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::NoDevice
        );
    }

    #[test]
    fn loopback_silent_peer_drops_but_acks() {
        let (a, b) = LoopbackLink::pair();
        let (tx, rx) = sync_channel(4);
        let recorder: Arc<dyn InboundHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.attach(Arc::downgrade(&recorder));
        b.set_silent(true);

        let (completion, status) = status_channel();
        a.send(start_message(), completion);
        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::Delivered
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn loopback_memory_transfer() {
        let (a, b) = LoopbackLink::pair();
        let (tx, rx) = sync_channel(4);
        let recorder: Arc<dyn InboundHandler> = Arc::new(Recorder { tx: Mutex::new(tx) });
        b.attach(Arc::downgrade(&recorder));

        let address = a.translate_address(MemoryRegion::TransactionBackup).unwrap();
        let (completion, status) = status_channel();
        a.send_memory(
            MemoryDescriptor {
                region: MemoryRegion::TransactionBackup,
                peer_address: address,
                data: Bytes::from_static(b"backup"),
                message: start_message(),
            },
            completion,
        );
        assert_eq!(
            status.recv_timeout(Duration::from_secs(5)).unwrap(),
            SendStatus::Delivered
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "memory:6");

        b.set_dma_enabled(false);
        assert!(a.translate_address(MemoryRegion::TransactionBackup).is_none());
    }

    #[test]
    fn confirm_status_is_ok() {
        assert!(ConfirmStatus::Ok.is_ok());
        assert!(!ConfirmStatus::LargerMessageSize { supported: 1 }.is_ok());
    }
}
