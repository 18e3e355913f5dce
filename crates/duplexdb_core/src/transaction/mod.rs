//! The configuration transaction and its machinery.
//!
//! - [`Transaction`] holds the staged entries of the one in-flight change
//! - [`TransactionManager`] owns the slot it lives in
//! - `apply` moves staged entries into the committed tables and the logs
//! - `session` pairs the general-log and system-log transactions

pub(crate) mod apply;
mod manager;
pub(crate) mod session;
mod slots;
mod state;

pub use apply::{Direction, Effect, WalkReport};
pub use manager::{TakenTransaction, TransactionManager};
pub use slots::{EntrySlots, Placement, StagedEntry};
pub use state::{Transaction, TransactionInfo};
