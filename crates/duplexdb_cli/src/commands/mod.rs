//! CLI command implementations.

pub mod hooks;
pub mod intent;
pub mod simulate;
