// Duplicate message checker
// Serializes the check of one payload through a per-payload distributed mutex
// and records seen payloads as TTL'd marker keys

use std::sync::Arc;

use metrics::counter;
use msgfilter_common::{
    DATA_MARKER_VALUE, DEFAULT_DATA_TTL_SECS, DEFAULT_ETCD_ENDPOINT, DEFAULT_LOCK_TTL_SECS,
    MsgFilterError, Result, data_key, lock_key,
};
use msgfilter_store::{KvStore, StoreClientFactory};
use tracing::{debug, error, warn};

use crate::identity::IdentityGenerator;
use crate::mutex::{DistributedMutex, MutexOptions};

/// Checker construction parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerConfig {
    pub endpoint: String,
    /// Lock record TTL in seconds; 0 lets the mutex pick its default
    pub lock_ttl: u64,
    /// How long a payload stays known as seen, in seconds; 0 means forever
    pub data_ttl: u64,
    pub mutex: MutexOptions,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ETCD_ENDPOINT.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL_SECS,
            data_ttl: DEFAULT_DATA_TTL_SECS,
            mutex: MutexOptions::default(),
        }
    }
}

/// Outcome of a duplicate check.
///
/// When `error` is set, `duplicate` is always true: a failed check never lets
/// a message through as novel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub duplicate: bool,
    pub error: Option<MsgFilterError>,
}

impl CheckResult {
    pub fn novel() -> Self {
        Self {
            duplicate: false,
            error: None,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            duplicate: true,
            error: None,
        }
    }

    pub fn failed(error: MsgFilterError) -> Self {
        Self {
            duplicate: true,
            error: Some(error),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn into_parts(self) -> (bool, Option<MsgFilterError>) {
        (self.duplicate, self.error)
    }

    fn label(&self) -> &'static str {
        match (&self.error, self.duplicate) {
            (Some(_), _) => "error",
            (None, true) => "duplicate",
            (None, false) => "novel",
        }
    }
}

/// Collapse a check into its reported form, treating any error as a duplicate
pub fn fail_closed(result: Result<bool>) -> CheckResult {
    match result {
        Ok(true) => CheckResult::duplicate(),
        Ok(false) => CheckResult::novel(),
        Err(e) => CheckResult::failed(e),
    }
}

/// Releases a held payload lock, or spawns the release if dropped first.
///
/// A check whose future is cancelled after locking would otherwise leave the
/// lock record behind until its TTL runs out.
struct LockRelease {
    mutex: Option<Arc<DistributedMutex>>,
}

impl LockRelease {
    fn new(mutex: Arc<DistributedMutex>) -> Self {
        Self { mutex: Some(mutex) }
    }

    async fn release(mut self) {
        if let Some(mutex) = self.mutex.take() {
            unlock_logged(&mutex).await;
        }
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        let Some(mutex) = self.mutex.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %mutex.key(), "Check cancelled, releasing lock in background");
                handle.spawn(async move {
                    unlock_logged(&mutex).await;
                });
            }
            Err(_) => {
                warn!(key = %mutex.key(), "No runtime to release lock, it will expire");
            }
        }
    }
}

async fn unlock_logged(mutex: &DistributedMutex) {
    if let Err(e) = mutex.unlock().await {
        // The lock record expires on its own
        warn!(key = %mutex.key(), error = %e, "Failed to release lock");
    }
}

/// Tells whether a payload was already seen within the dedup window.
///
/// Safe to share across tasks; each call builds its own mutex.
pub struct DuplicateChecker {
    store: Arc<dyn KvStore>,
    identity: Arc<dyn IdentityGenerator>,
    config: CheckerConfig,
}

impl DuplicateChecker {
    pub fn new(
        config: CheckerConfig,
        factory: &dyn StoreClientFactory,
        identity: Arc<dyn IdentityGenerator>,
    ) -> Result<Self> {
        let store = factory.connect(&config.endpoint)?;
        Ok(Self::with_store(config, store, identity))
    }

    pub fn with_store(
        config: CheckerConfig,
        store: Arc<dyn KvStore>,
        identity: Arc<dyn IdentityGenerator>,
    ) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    /// Check `msg` and mark it as seen if it is novel.
    pub async fn is_duplicate(&self, msg: &str) -> CheckResult {
        let result = fail_closed(self.check(msg).await);
        if let Some(e) = &result.error {
            error!(payload = %msg, error = %e, "Duplicate check failed");
        }
        counter!("msgfilter_checks_total", "result" => result.label()).increment(1);
        result
    }

    async fn check(&self, msg: &str) -> Result<bool> {
        let mutex = Arc::new(DistributedMutex::new(
            &lock_key(msg),
            self.config.lock_ttl,
            self.store.clone(),
            self.identity.as_ref(),
            self.config.mutex.clone(),
        )?);

        mutex.lock().await?;
        let release = LockRelease::new(mutex);
        let result = self.read_or_mark(msg).await;
        release.release().await;
        result
    }

    async fn read_or_mark(&self, msg: &str) -> Result<bool> {
        let key = data_key(msg);
        match self.store.get(&key).await {
            Ok(_) => {
                debug!(key = %key, "Payload already seen");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                self.store
                    .create_if_absent(&key, DATA_MARKER_VALUE, self.data_ttl())
                    .await?;
                debug!(key = %key, ttl = self.config.data_ttl, "Payload marked as seen");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn data_ttl(&self) -> Option<std::time::Duration> {
        (self.config.data_ttl > 0).then(|| std::time::Duration::from_secs(self.config.data_ttl))
    }
}
