//! msgfilter Common - Shared types, errors, and key layout
//!
//! This crate provides the foundational pieces used across all msgfilter components:
//! - `MsgFilterError` and the crate-wide `Result` alias
//! - Key namespaces for lock records and data markers
//! - Default policy values

pub mod error;

pub use error::{ERROR_CODE_EVENT_INDEX_CLEARED, MsgFilterError, Result};

/// Namespace for lock records, one per distinct payload
pub const LOCK_KEY_PREFIX: &str = "/lock/";

/// Namespace for "already seen" markers
pub const DATA_KEY_PREFIX: &str = "/data/";

/// Sentinel stored under a data marker key; only its presence matters
pub const DATA_MARKER_VALUE: &str = "duplicate";

/// Default lock record TTL handed to the checker (seconds)
pub const DEFAULT_LOCK_TTL_SECS: u64 = 10;

/// Default dedup window (seconds)
pub const DEFAULT_DATA_TTL_SECS: u64 = 600;

/// TTL substituted by the mutex when asked for less than one second
pub const DEFAULT_MUTEX_TTL_SECS: u64 = 60;

/// Attempts for lock acquisition and for lock release
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

pub const DEFAULT_LISTEN_PORT: u16 = 5001;

pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Lock key guarding the check of `payload`
pub fn lock_key(payload: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, payload)
}

/// Marker key recording that `payload` has been seen
pub fn data_key(payload: &str) -> String {
    format!("{}{}", DATA_KEY_PREFIX, payload)
}

/// Make a key absolute, rejecting empty keys.
pub fn normalize_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(MsgFilterError::InvalidKey(key.to_string()));
    }
    if key.starts_with('/') {
        Ok(key.to_string())
    } else {
        Ok(format!("/{}", key))
    }
}
