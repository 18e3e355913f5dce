//! # DuplexDB Core
//!
//! Configuration transaction engine for a dual-controller storage array.
//!
//! This crate provides:
//! - The four configuration tables (objects, users, edges, global info)
//! - A single-slot transaction that stages creates, modifies and destroys
//! - Commit and rollback through the general and system logs
//! - Replication of every step to the peer controller
//! - Recovery of an interrupted transaction after the peer dies
//! - Named test checkpoints that pause or crash a transaction
//!
//! The [`Engine`] is the entry point; see the [`engine`] module for roles
//! and an example.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod completion;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod hooks;
pub mod jobs;
pub mod table;
pub mod topology;
pub mod transaction;
pub mod types;

pub use config::{EngineConfig, SlotLimits};
pub use engine::{Engine, EngineBuilder, RecoveryAction};
pub use entry::{
    EdgeEntry, EdgeLink, Entry, EntryHeader, EntryState, GlobalInfo, GlobalInfoEntry,
    GlobalInfoType, LiveOutcome, ObjectConfig, ObjectEntry, Persistable, TableEntry, UserEntry,
    UserRecord,
};
pub use error::{DatabaseError, DatabaseResult};
pub use hooks::{HookAction, HookBehavior, HookContext, HookRegistry, HookState, HookType};
pub use jobs::{JobNotifier, NullJobNotifier, RecordingJobNotifier};
pub use table::{EntryTables, Table, TableGuard};
pub use topology::{InMemoryTopology, LiveObject, Topology};
pub use transaction::{
    Direction, Effect, EntrySlots, Placement, StagedEntry, TakenTransaction, Transaction,
    TransactionInfo, TransactionManager, WalkReport,
};
pub use types::{
    ControllerRole, JobNumber, ObjectId, ServiceState, TableKind, TransactionId,
    TransactionState, TransactionType,
};
