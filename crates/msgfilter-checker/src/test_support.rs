// Scripted store double for unit tests
// Records every call and replies from per-operation queues

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use msgfilter_common::Result;
use msgfilter_store::{KvRead, KvRecord, KvStore, WatchAction, WatchEvent};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Get(String),
    Create(String, String, Option<Duration>),
    Delete(String),
    Watch(String, u64),
}

struct Script<T> {
    queue: VecDeque<Result<T>>,
    fallback: Option<Result<T>>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            fallback: None,
        }
    }

    fn next(&mut self, operation: &str) -> Result<T> {
        self.queue
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| panic!("unexpected {} call", operation))
    }
}

pub(crate) struct ScriptedStore {
    calls: Mutex<Vec<Call>>,
    gets: Mutex<Script<KvRead>>,
    creates: Mutex<Script<KvRecord>>,
    deletes: Mutex<Script<()>>,
    watches: Mutex<Script<WatchEvent>>,
}

impl ScriptedStore {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gets: Mutex::new(Script::new()),
            creates: Mutex::new(Script::new()),
            deletes: Mutex::new(Script::new()),
            watches: Mutex::new(Script::new()),
        }
    }

    /// Reply to a get with the record's own index as the store index
    pub(crate) fn on_get(&self, reply: Result<KvRecord>) -> &Self {
        self.on_read(reply.map(|record| KvRead::new(record, 0)))
    }

    pub(crate) fn on_read(&self, reply: Result<KvRead>) -> &Self {
        self.gets.lock().queue.push_back(reply);
        self
    }

    pub(crate) fn on_create(&self, reply: Result<KvRecord>) -> &Self {
        self.creates.lock().queue.push_back(reply);
        self
    }

    pub(crate) fn on_delete(&self, reply: Result<()>) -> &Self {
        self.deletes.lock().queue.push_back(reply);
        self
    }

    pub(crate) fn on_watch(&self, reply: Result<WatchEvent>) -> &Self {
        self.watches.lock().queue.push_back(reply);
        self
    }

    /// Reply used for every create once the queue is drained
    pub(crate) fn always_create(&self, reply: Result<KvRecord>) -> &Self {
        self.creates.lock().fallback = Some(reply);
        self
    }

    pub(crate) fn always_delete(&self, reply: Result<()>) -> &Self {
        self.deletes.lock().fallback = Some(reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record_call(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

pub(crate) fn record(key: &str, value: &str, index: u64) -> KvRecord {
    KvRecord {
        key: key.to_string(),
        value: Some(value.to_string()),
        created_index: index,
        modified_index: index,
        ..Default::default()
    }
}

pub(crate) fn event(action: WatchAction, key: &str, index: u64) -> WatchEvent {
    WatchEvent {
        action,
        key: key.to_string(),
        index,
        record: None,
    }
}

#[async_trait]
impl KvStore for ScriptedStore {
    async fn get(&self, key: &str) -> Result<KvRead> {
        self.record_call(Call::Get(key.to_string()));
        self.gets.lock().next("get")
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvRecord> {
        self.record_call(Call::Create(key.to_string(), value.to_string(), ttl));
        self.creates.lock().next("create_if_absent")
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record_call(Call::Delete(key.to_string()));
        self.deletes.lock().next("delete")
    }

    async fn watch_after(&self, key: &str, after_index: u64) -> Result<WatchEvent> {
        self.record_call(Call::Watch(key.to_string(), after_index));
        self.watches.lock().next("watch_after")
    }
}
