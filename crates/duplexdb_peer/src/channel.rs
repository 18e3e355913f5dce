//! Peer channel abstraction.

use bytes::Bytes;

/// Outcome of a low-level send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// The transport handed the message to the peer.
    Delivered,
    /// There is no peer to deliver to.
    NoDevice,
    /// The transport failed.
    Failed(String),
}

/// Callback fired once the transport has dealt with a send.
pub type SendCompletion = Box<dyn FnOnce(SendStatus) + Send + 'static>;

/// Memory region on the peer addressable by bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryRegion {
    /// The peer's transaction backup buffer.
    TransactionBackup,
}

/// A bulk transfer into peer memory, with a message delivered after it lands.
#[derive(Debug, Clone)]
pub struct MemoryDescriptor {
    /// Target region.
    pub region: MemoryRegion,
    /// Physical address of the region on the peer.
    pub peer_address: u64,
    /// Bytes copied into the region.
    pub data: Bytes,
    /// Encoded message delivered once the copy completes.
    pub message: Bytes,
}

/// The messaging and bulk-transfer path between the two controllers.
///
/// Sends are asynchronous; the completion reports only whether the transport
/// delivered the bytes. Whether the peer acted on them arrives separately as
/// an inbound confirmation.
///
/// # Implementors
///
/// - [`super::LoopbackEndpoint`] - In-process link for tests and simulation
pub trait PeerChannel: Send + Sync {
    /// Sends a message.
    fn send(&self, message: Bytes, completion: SendCompletion);

    /// Copies memory into the peer, then delivers the attached message.
    fn send_memory(&self, descriptor: MemoryDescriptor, completion: SendCompletion);

    /// Returns true if the peer controller is present.
    fn is_peer_alive(&self) -> bool;

    /// Translates a region to its physical address on the peer.
    ///
    /// Returns `None` when bulk transfer is unavailable.
    fn translate_address(&self, region: MemoryRegion) -> Option<u64>;
}

/// Receives traffic arriving from the peer.
pub trait InboundHandler: Send + Sync {
    /// Handles an encoded message.
    fn on_message(&self, data: &[u8]);

    /// Handles a completed bulk transfer.
    fn on_memory(&self, descriptor: MemoryDescriptor);
}
