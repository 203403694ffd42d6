//! Shared helpers for the Nitra daemon: path validation, process
//! liveness/signalling, and durable small-state persistence.

pub mod paths;
pub mod process;
pub mod statefile;
