//! # DuplexDB Persist
//!
//! Persistence log contracts and reference implementations for DuplexDB.
//!
//! The configuration database persists through two independent logs:
//!
//! - the **general log** ([`PersistLog`]) holds records at allocated entry ids
//! - the **system log** ([`SystemLog`]) holds records for the reserved range of
//!   system object ids at fixed [`SystemKey`] locations
//!
//! Neither log knows what its records mean. The two commit separately, so
//! an [`IntentStore`] records which transaction is between the two commits.
//!
//! ## Available Implementations
//!
//! - [`InMemoryPersistLog`] and [`InMemorySystemLog`] - For testing and simulation
//! - [`InMemoryIntentStore`] - Ephemeral intent records
//! - [`FileIntentStore`] - Durable intent records in a single file
//!
//! ## Example
//!
//! ```rust
//! use duplexdb_persist::{InMemorySystemLog, SectorType, SystemKey, SystemLog, SystemOp};
//!
//! let log = InMemorySystemLog::new();
//! let key = SystemKey::new(SectorType::Objects, 1, 0);
//! let handle = log.start_transaction().unwrap();
//! log.persist_entry(handle, SystemOp::Create, key, b"vault").unwrap();
//! log.commit_transaction(handle).unwrap();
//! assert_eq!(log.read(key).unwrap(), Some(b"vault".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod intent;
mod log;
mod memory;
mod types;

pub use error::{PersistError, PersistResult};
pub use intent::{
    compute_crc32, FileIntentStore, InMemoryIntentStore, IntentDirection, IntentPhase,
    IntentRecord, IntentStore, INTENT_MAGIC, INTENT_VERSION,
};
pub use log::{PersistCompletion, PersistLog, SystemLog};
pub use memory::{InMemoryPersistLog, InMemorySystemLog};
pub use types::{EntryId, PersistHandle, ReplayOutcome, SectorType, SystemKey, SystemOp};
