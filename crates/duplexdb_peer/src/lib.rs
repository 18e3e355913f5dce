//! # DuplexDB Peer
//!
//! Replication protocol between the two controllers of a DuplexDB array.
//!
//! This crate provides:
//! - [`PeerMessage`] and its request/confirm bodies, encoded as CBOR
//! - [`PeerChannel`], the asynchronous send and bulk-transfer contract
//! - [`LoopbackLink`], an in-process channel pair with fault knobs
//!
//! It does not interpret transactions; entry payloads travel as opaque bytes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod error;
mod loopback;
mod message;

pub use channel::{
    InboundHandler, MemoryDescriptor, MemoryRegion, PeerChannel, SendCompletion, SendStatus,
};
pub use error::{PeerError, PeerResult};
pub use loopback::{LoopbackEndpoint, LoopbackLink, BACKUP_REGION_ADDRESS};
pub use message::{
    ConfirmStatus, EntryIdMap, PeerBody, PeerMessage, PeerOperation, PeerRequest, StagedRecord,
    TransactionBackup, TransactionSummary, VersionHeader, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
