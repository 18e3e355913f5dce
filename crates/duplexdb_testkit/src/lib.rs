//! # DuplexDB Testkit
//!
//! Test utilities for DuplexDB.
//!
//! This crate provides:
//! - Single and dual controller fixtures wired over a loopback link
//! - A controller whose intent record lives in a temporary directory
//! - A persistence log wrapper that injects busy, write and commit faults
//! - Helpers that crash a controller at a named checkpoint
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duplexdb_testkit::prelude::*;
//!
//! #[test]
//! fn survives_peer_death() {
//!     let array = DuplexArray::new();
//!     array.active.start(job(1)).unwrap();
//!     array.kill_active();
//!     array.passive.recover_after_peer_death().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use faults::*;
pub use fixtures::*;
pub use generators::*;
