//! msgfilter Checker - distributed locking and duplicate detection
//!
//! This crate provides:
//! - [`DistributedMutex`], a lease-based lock held as a store key
//! - [`DuplicateChecker`], which answers "seen before?" for a payload
//! - Holder identity generation

pub mod checker;
pub mod identity;
pub mod mutex;

#[cfg(test)]
mod test_support;

pub use checker::{CheckResult, CheckerConfig, DuplicateChecker, fail_closed};
pub use identity::{HostIdentity, IdentityGenerator, StaticIdentity};
pub use mutex::{DistributedMutex, LockState, MutexOptions};
