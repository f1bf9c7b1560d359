//! Error types for msgfilter
//!
//! `MsgFilterError` is shared by the store clients, the distributed mutex
//! and the duplicate checker so that store-level conditions (`NotFound`,
//! `AlreadyExists`) can drive protocol decisions without string matching.

use std::time::Duration;

/// Store error code for a watch that starts before the retained event history
pub const ERROR_CODE_EVENT_INDEX_CLEARED: i64 = 401;

/// Application-specific error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MsgFilterError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store error: code={code}, message={message}")]
    Store { code: i64, message: String },

    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl MsgFilterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MsgFilterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, MsgFilterError::AlreadyExists(_))
    }

    /// Transport-level failures that a fresh attempt may get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MsgFilterError::StoreUnavailable(_) | MsgFilterError::Store { .. }
        )
    }

    /// The watch start index fell out of the store's event history
    pub fn is_history_cleared(&self) -> bool {
        matches!(
            self,
            MsgFilterError::Store {
                code: ERROR_CODE_EVENT_INDEX_CLEARED,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, MsgFilterError>;
