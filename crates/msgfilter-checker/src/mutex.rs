//! Lease-based distributed mutex
//!
//! A lock is a key created with create-if-absent semantics and a TTL. A caller
//! that finds the key taken reads it along with the store's current index,
//! watches the key from that index, and retries the create once it sees the
//! record deleted or expired. A crashed holder therefore blocks others for at
//! most the lock TTL.
//!
//! Exclusion is advisory: `unlock` deletes the key without checking which
//! holder wrote it.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use msgfilter_common::{
    DEFAULT_MUTEX_TTL_SECS, DEFAULT_RETRY_ATTEMPTS, MsgFilterError, Result, normalize_key,
};
use msgfilter_store::KvStore;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::identity::IdentityGenerator;

/// Retry and lease policy for [`DistributedMutex`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutexOptions {
    /// Attempts of the whole acquire sequence
    pub max_attempts: u32,
    /// Attempts to delete the lock record on release
    pub unlock_attempts: u32,
    /// TTL used when the caller asks for less than one second
    pub default_ttl: Duration,
    /// Overall deadline for `lock()`; `None` waits as long as contention lasts
    pub acquire_timeout: Option<Duration>,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            unlock_attempts: DEFAULT_RETRY_ATTEMPTS,
            default_ttl: Duration::from_secs(DEFAULT_MUTEX_TTL_SECS),
            acquire_timeout: None,
        }
    }
}

/// Where the acquire state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockState {
    #[default]
    Idle,
    Creating,
    Conflicted,
    Watching,
    Acquired,
    Failed,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Idle => "idle",
            LockState::Creating => "creating",
            LockState::Conflicted => "conflicted",
            LockState::Watching => "watching",
            LockState::Acquired => "acquired",
            LockState::Failed => "failed",
        }
    }
}

impl Display for LockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mutual exclusion lock shared by every process using the same store
pub struct DistributedMutex {
    key: String,
    /// Identity of the caller, stored as the lock record value
    id: String,
    ttl: Duration,
    store: Arc<dyn KvStore>,
    options: MutexOptions,
    /// Serializes use of this instance within the process
    local: Arc<tokio::sync::Mutex<()>>,
    /// Local guard kept from a successful `lock()` until `unlock()`
    held: Mutex<Option<OwnedMutexGuard<()>>>,
    state: Mutex<LockState>,
}

impl DistributedMutex {
    /// Create a mutex for `key`, which must be the same on every node.
    pub fn new(
        key: &str,
        ttl_secs: u64,
        store: Arc<dyn KvStore>,
        identity: &dyn IdentityGenerator,
        options: MutexOptions,
    ) -> Result<Self> {
        let key = normalize_key(key)?;
        let ttl = if ttl_secs < 1 {
            options.default_ttl
        } else {
            Duration::from_secs(ttl_secs)
        };

        Ok(Self {
            key,
            id: identity.generate(),
            ttl,
            store,
            options,
            local: Arc::new(tokio::sync::Mutex::new(())),
            held: Mutex::new(None),
            state: Mutex::new(LockState::Idle),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    fn transition(&self, next: LockState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(key = %self.key, from = state.as_str(), to = next.as_str(), "Lock state changed");
            *state = next;
        }
    }

    /// Lock the mutex.
    ///
    /// If the lock is already in use, blocks until the holder releases it or
    /// its lease runs out.
    pub async fn lock(&self) -> Result<()> {
        let local = self.local.clone().lock_owned().await;
        let started = Instant::now();

        let result = match self.options.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.acquire_with_retry())
                .await
                .unwrap_or_else(|_| Err(MsgFilterError::LockTimeout(timeout))),
            None => self.acquire_with_retry().await,
        };

        match result {
            Ok(()) => {
                histogram!("msgfilter_lock_acquire_seconds")
                    .record(started.elapsed().as_secs_f64());
                *self.held.lock() = Some(local);
                Ok(())
            }
            Err(e) => {
                self.transition(LockState::Failed);
                counter!("msgfilter_lock_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn acquire_with_retry(&self) -> Result<()> {
        let attempts = self.options.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.acquire().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    debug!(key = %self.key, attempt, error = %e, "Lock attempt failed");
                    if attempt < attempts {
                        debug!(key = %self.key, "Trying to lock again");
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MsgFilterError::InternalError(format!("no lock attempt made for {}", self.key))
        }))
    }

    /// One pass of create -> read on conflict -> watch -> create again
    async fn acquire(&self) -> Result<()> {
        loop {
            self.transition(LockState::Creating);
            debug!(key = %self.key, holder = %self.id, "Trying to create lock record");
            match self
                .store
                .create_if_absent(&self.key, &self.id, Some(self.ttl))
                .await
            {
                Ok(record) => {
                    self.transition(LockState::Acquired);
                    debug!(
                        key = %self.key,
                        holder = %self.id,
                        index = record.modified_index,
                        "Lock acquired"
                    );
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => {
                    debug!(key = %self.key, "Lock record exists");
                }
                Err(e) => return Err(e),
            }

            self.transition(LockState::Conflicted);
            let mut after_index = match self.store.get(&self.key).await {
                Ok(read) => read.index,
                // Released between our create and this read
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            self.transition(LockState::Watching);
            loop {
                debug!(key = %self.key, after_index, "Watching lock record");
                let event = match self.store.watch_after(&self.key, after_index).await {
                    Ok(event) => event,
                    Err(e) if e.is_history_cleared() => {
                        debug!(key = %self.key, after_index, "Watch index cleared, trying again");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                debug!(
                    key = %self.key,
                    action = %event.action,
                    index = event.index,
                    "Watch woken"
                );
                if event.action.releases_key() {
                    break;
                }
                after_index = after_index.max(event.index);
            }
        }
    }

    /// Unlock the mutex by deleting the lock record.
    ///
    /// A record that is already gone counts as released. The local guard is
    /// given up whatever the outcome.
    pub async fn unlock(&self) -> Result<()> {
        let _local = self.held.lock().take();
        let attempts = self.options.unlock_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.delete(&self.key).await {
                Ok(()) => {
                    debug!(key = %self.key, "Lock released");
                    last_error = None;
                    break;
                }
                Err(e) if e.is_not_found() => {
                    debug!(key = %self.key, "Lock record already gone");
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(key = %self.key, attempt, error = %e, "Failed to delete lock record");
                    let transient = e.is_transient();
                    last_error = Some(e);
                    if !transient {
                        break;
                    }
                }
            }
        }

        self.transition(LockState::Idle);
        match last_error {
            None => Ok(()),
            Some(e) => {
                counter!("msgfilter_unlock_failures_total").increment(1);
                Err(e)
            }
        }
    }
}
