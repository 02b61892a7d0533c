//! ragctl: lifecycle controller for a containerised retrieval stack
//!
//! Forced shutdown, verified snapshots, restores with rollback and
//! safety-copy rotation, all driven through the Docker runtime.

pub mod core;
pub mod utils;
