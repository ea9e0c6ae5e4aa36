//! Ops commands for store maintenance

pub mod repair;
pub mod verify;

pub use repair::{repair_orphans, RepairReport};
pub use verify::{verify_store, FileRef, VerifyReport};
