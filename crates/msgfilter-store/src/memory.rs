// In-process key-value store
// Implements the store contract with a global modification index, TTL leases,
// and an etcd-style bounded event history for watches

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use msgfilter_common::{ERROR_CODE_EVENT_INDEX_CLEARED, MsgFilterError, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::client::KvStore;
use crate::model::{KvRead, KvRecord, WatchAction, WatchEvent};

/// Number of past events kept for watch replay (etcd keeps 1000)
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct StoredEntry {
    record: KvRecord,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

struct EventLog {
    events: VecDeque<WatchEvent>,
    capacity: usize,
    truncated: bool,
}

/// In-memory key-value store
///
/// Leases are tracked in a deadline queue that every operation drains, so
/// expired keys are reaped even when nothing touches them again. A watcher
/// whose key reaches its deadline drains the queue too. Each reaped key
/// publishes an `expire` event.
#[derive(Clone)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, StoredEntry>>,
    /// Global index counter
    index: Arc<AtomicU64>,
    log: Arc<Mutex<EventLog>>,
    events: broadcast::Sender<WatchEvent>,
    deadlines: Arc<Mutex<BinaryHeap<Reverse<(Instant, String)>>>>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(DashMap::new()),
            index: Arc::new(AtomicU64::new(0)),
            log: Arc::new(Mutex::new(EventLog {
                events: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                truncated: false,
            })),
            events,
            deadlines: Arc::new(Mutex::new(BinaryHeap::new())),
        }
    }

    /// Index of the most recent change
    pub fn current_index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    /// Number of stored keys, including expired ones not yet reaped
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate the next index, build the event, and publish it.
    ///
    /// Index allocation and history append happen under one lock so the
    /// history stays ordered by index.
    fn commit(&self, build: impl FnOnce(u64) -> WatchEvent) -> WatchEvent {
        let mut log = self.log.lock();
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        let event = build(index);

        if log.events.len() == log.capacity {
            log.events.pop_front();
            log.truncated = true;
        }
        log.events.push_back(event.clone());
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        event
    }

    fn removal_event(action: WatchAction, mut record: KvRecord, index: u64) -> WatchEvent {
        record.modified_index = index;
        record.value = None;
        WatchEvent::new(action, record)
    }

    /// Remove `key` if its lease has run out. Returns true if it expired.
    fn expire_if_due(&self, key: &str) -> bool {
        let now = Instant::now();
        if let Entry::Occupied(occupied) = self.entries.entry(key.to_string())
            && occupied.get().is_expired(now)
        {
            let stored = occupied.remove();
            self.commit(|index| Self::removal_event(WatchAction::Expire, stored.record, index));
            debug!(key = %key, "Key expired");
            return true;
        }
        false
    }

    /// Remove every key whose lease has run out. Returns how many expired.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let due = {
            let mut deadlines = self.deadlines.lock();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, _))) = deadlines.peek() {
                if *deadline > now {
                    break;
                }
                if let Some(Reverse((_, key))) = deadlines.pop() {
                    due.push(key);
                }
            }
            due
        };

        // A key recreated since its deadline was queued is left alone
        due.iter().filter(|key| self.expire_if_due(key)).count()
    }

    /// First retained event for `key` above `after_index`
    fn replay(&self, key: &str, after_index: u64) -> Result<Option<WatchEvent>> {
        let log = self.log.lock();
        if log.truncated
            && let Some(oldest) = log.events.front()
            && after_index + 1 < oldest.index
        {
            return Err(MsgFilterError::Store {
                code: ERROR_CODE_EVENT_INDEX_CLEARED,
                message: format!(
                    "The event in requested index is outdated and cleared (requested: {}, oldest: {})",
                    after_index + 1,
                    oldest.index
                ),
            });
        }

        Ok(log
            .events
            .iter()
            .find(|event| event.key == key && event.index > after_index)
            .cloned())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MsgFilterError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<KvRead> {
        validate_key(key)?;
        self.reap_expired();

        // Index first: a change landing between the two reads is then above it
        let index = self.current_index();
        self.entries
            .get(key)
            .map(|entry| KvRead::new(entry.record.clone(), index))
            .ok_or_else(|| MsgFilterError::NotFound(key.to_string()))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvRecord> {
        validate_key(key)?;
        self.reap_expired();

        let ttl = ttl.filter(|ttl| !ttl.is_zero());
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(MsgFilterError::AlreadyExists(key.to_string())),
            Entry::Vacant(vacant) => {
                let event = self.commit(|index| {
                    WatchEvent::new(
                        WatchAction::Create,
                        KvRecord {
                            key: key.to_string(),
                            value: Some(value.to_string()),
                            created_index: index,
                            modified_index: index,
                            ttl: ttl.map(|ttl| ttl.as_secs() as i64),
                            expiration: None,
                        },
                    )
                });
                let record = event.record.unwrap_or_default();
                let expires_at = ttl.map(|ttl| Instant::now() + ttl);
                vacant.insert(StoredEntry {
                    record: record.clone(),
                    expires_at,
                });
                if let Some(deadline) = expires_at {
                    self.deadlines.lock().push(Reverse((deadline, key.to_string())));
                }
                Ok(record)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.reap_expired();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let stored = occupied.remove();
                self.commit(|index| Self::removal_event(WatchAction::Delete, stored.record, index));
                Ok(())
            }
            Entry::Vacant(_) => Err(MsgFilterError::NotFound(key.to_string())),
        }
    }

    async fn watch_after(&self, key: &str, after_index: u64) -> Result<WatchEvent> {
        validate_key(key)?;

        loop {
            // Subscribe before replaying so nothing falls between the two
            let mut receiver = self.events.subscribe();
            if let Some(event) = self.replay(key, after_index)? {
                return Ok(event);
            }

            let deadline = self.entries.get(key).and_then(|entry| entry.expires_at);
            let expiry = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(event) if event.key == key && event.index > after_index => return Ok(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        return Err(MsgFilterError::StoreUnavailable(
                            "memory store event channel closed".to_string(),
                        ));
                    }
                },
                _ = expiry => {
                    self.reap_expired();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryKvStore::new();

        let created = store
            .create_if_absent("/data/hello", "duplicate", None)
            .await
            .unwrap();
        assert_eq!(created.created_index, 1);
        assert_eq!(created.modified_index, 1);

        let read = store.get("/data/hello").await.unwrap();
        assert_eq!(read.record.value.as_deref(), Some("duplicate"));
        assert_eq!(read.index, 1);
        assert_eq!(store.current_index(), 1);
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = MemoryKvStore::new();
        store.create_if_absent("/lock/a", "one", None).await.unwrap();

        let result = store.create_if_absent("/lock/a", "two", None).await;
        assert_eq!(
            result,
            Err(MsgFilterError::AlreadyExists("/lock/a".to_string()))
        );
        // Original value untouched
        assert_eq!(
            store.get("/lock/a").await.unwrap().record.value.as_deref(),
            Some("one")
        );
    }

    #[tokio::test]
    async fn test_get_and_delete_missing() {
        let store = MemoryKvStore::new();
        assert!(store.get("/missing").await.unwrap_err().is_not_found());
        assert!(store.delete("/missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = MemoryKvStore::new();
        assert_eq!(
            store.get("").await,
            Err(MsgFilterError::InvalidKey(String::new()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryKvStore::new();
        store
            .create_if_absent("/data/x", "duplicate", Some(Duration::from_secs(600)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(store.get("/data/x").await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("/data/x").await.unwrap_err().is_not_found());
        // A fresh create succeeds once the lease is gone
        assert!(
            store
                .create_if_absent("/data/x", "duplicate", Some(Duration::from_secs(600)))
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let store = MemoryKvStore::new();
        store
            .create_if_absent("/k", "v", Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(store.get("/k").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_delete() {
        let store = MemoryKvStore::new();
        let record = store.create_if_absent("/lock/a", "holder", None).await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch_after("/lock/a", record.modified_index).await })
        };
        tokio::task::yield_now().await;
        store.delete("/lock/a").await.unwrap();

        let event = watcher.await.unwrap().unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.key, "/lock/a");
        assert_eq!(event.index, 2);
    }

    #[tokio::test]
    async fn test_watch_replays_history() {
        let store = MemoryKvStore::new();
        store.create_if_absent("/lock/a", "holder", None).await.unwrap();
        store.create_if_absent("/other", "x", None).await.unwrap();
        store.delete("/lock/a").await.unwrap();

        // The delete already happened; the watch must still report it
        let event = store.watch_after("/lock/a", 1).await.unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.index, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_expiry() {
        let store = MemoryKvStore::new();
        let record = store
            .create_if_absent("/lock/a", "holder", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let event = store
            .watch_after("/lock/a", record.modified_index)
            .await
            .unwrap();
        assert_eq!(event.action, WatchAction::Expire);
        assert!(store.get("/lock/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_history_cleared() {
        let store = MemoryKvStore::with_history_capacity(2);
        for key in ["/a", "/b", "/c"] {
            store.create_if_absent(key, "v", None).await.unwrap();
        }

        let result = store.watch_after("/a", 0).await;
        assert!(matches!(
            result,
            Err(MsgFilterError::Store { code: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_reports_current_index() {
        let store = MemoryKvStore::new();
        store.create_if_absent("/lock/a", "holder", None).await.unwrap();
        for n in 0..5 {
            store
                .create_if_absent(&format!("/other/{n}"), "v", None)
                .await
                .unwrap();
        }

        let read = store.get("/lock/a").await.unwrap();
        assert_eq!(read.record.modified_index, 1);
        assert_eq!(read.index, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_keys_are_reaped() {
        let store = MemoryKvStore::with_history_capacity(2048);
        for n in 0..500 {
            store
                .create_if_absent(&format!("/data/{n}"), "duplicate", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 500);

        tokio::time::advance(Duration::from_secs(2)).await;
        store
            .create_if_absent("/data/fresh", "duplicate", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        // Each reaped key published its own expire event
        let event = store.watch_after("/data/42", 43).await.unwrap();
        assert_eq!(event.action, WatchAction::Expire);
        assert_eq!(event.key, "/data/42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_skips_recreated_key() {
        let store = MemoryKvStore::new();
        store
            .create_if_absent("/k", "v1", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.delete("/k").await.unwrap();
        store
            .create_if_absent("/k", "v2", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        // The first lease's deadline passes while the second is still live
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.reap_expired(), 0);
        assert_eq!(
            store.get("/k").await.unwrap().record.value.as_deref(),
            Some("v2")
        );
    }
}
