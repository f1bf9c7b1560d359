// Key-value store models
// Records and watch events shared by every store implementation

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A stored key with its value and bookkeeping indexes.
///
/// Field names follow the etcd v2 node layout so the HTTP client can decode
/// responses straight into this type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvRecord {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub created_index: u64,

    #[serde(default)]
    pub modified_index: u64,

    /// Remaining lease in seconds, if the key expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

impl KvRecord {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }
}

/// A record read together with the store's index at read time.
///
/// `index` is at least `record.modified_index`. Watches start from it, so a
/// long-held record does not push the watch start out of the store's event
/// history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRead {
    pub record: KvRecord,
    pub index: u64,
}

impl KvRead {
    pub fn new(record: KvRecord, index: u64) -> Self {
        let index = index.max(record.modified_index);
        Self { record, index }
    }
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WatchAction {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    Other(String),
}

impl WatchAction {
    pub fn as_str(&self) -> &str {
        match self {
            WatchAction::Get => "get",
            WatchAction::Set => "set",
            WatchAction::Create => "create",
            WatchAction::Update => "update",
            WatchAction::Delete => "delete",
            WatchAction::Expire => "expire",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::CompareAndDelete => "compareAndDelete",
            WatchAction::Other(action) => action,
        }
    }

    /// Whether the key is gone after this event.
    pub fn releases_key(&self) -> bool {
        matches!(
            self,
            WatchAction::Delete | WatchAction::Expire | WatchAction::CompareAndDelete
        )
    }
}

impl From<&str> for WatchAction {
    fn from(value: &str) -> Self {
        match value {
            "get" => WatchAction::Get,
            "set" => WatchAction::Set,
            "create" => WatchAction::Create,
            "update" => WatchAction::Update,
            "delete" => WatchAction::Delete,
            "expire" => WatchAction::Expire,
            "compareAndSwap" => WatchAction::CompareAndSwap,
            "compareAndDelete" => WatchAction::CompareAndDelete,
            other => WatchAction::Other(other.to_string()),
        }
    }
}

impl From<String> for WatchAction {
    fn from(value: String) -> Self {
        WatchAction::from(value.as_str())
    }
}

impl From<WatchAction> for String {
    fn from(value: WatchAction) -> Self {
        value.as_str().to_string()
    }
}

impl Display for WatchAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single change observed on a watched key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// Store index at which the change happened
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<KvRecord>,
}

impl WatchEvent {
    pub fn new(action: WatchAction, record: KvRecord) -> Self {
        Self {
            action,
            key: record.key.clone(),
            index: record.modified_index,
            record: Some(record),
        }
    }
}
