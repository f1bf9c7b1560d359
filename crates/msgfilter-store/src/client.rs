//! Store client contract
//!
//! The duplicate checker and the distributed mutex only ever talk to the
//! store through [`KvStore`]. Connections are created by a
//! [`StoreClientFactory`] handed in at construction time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgfilter_common::{MsgFilterError, Result};

use crate::etcd::{EtcdConfig, EtcdKvStore};
use crate::memory::MemoryKvStore;
use crate::model::{KvRead, KvRecord, WatchEvent};

/// Endpoint scheme selecting the in-process store
pub const MEMORY_SCHEME: &str = "memory://";

/// Conditional key-value operations required by the lock and dedup protocol
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key along with the store's current index; `NotFound` if absent
    async fn get(&self, key: &str) -> Result<KvRead>;

    /// Write a key only if it does not exist; `AlreadyExists` otherwise.
    /// A `ttl` of `None` or zero means the key never expires.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvRecord>;

    /// Remove a key; `NotFound` if absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// Block until the next change to `key` with an index above `after_index`
    async fn watch_after(&self, key: &str, after_index: u64) -> Result<WatchEvent>;
}

/// Creates store clients for an endpoint
pub trait StoreClientFactory: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn KvStore>>;
}

/// Factory used by the server: `memory://` or an etcd `http(s)://` endpoint
#[derive(Clone, Debug)]
pub struct DefaultStoreFactory {
    pub request_timeout: Duration,
}

impl Default for DefaultStoreFactory {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
        }
    }
}

impl DefaultStoreFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl StoreClientFactory for DefaultStoreFactory {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn KvStore>> {
        if endpoint.starts_with(MEMORY_SCHEME) {
            tracing::warn!(
                endpoint = %endpoint,
                "Using in-process store, duplicates are not shared between instances"
            );
            return Ok(Arc::new(MemoryKvStore::new()));
        }

        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            let config = EtcdConfig::new(endpoint).with_request_timeout(self.request_timeout);
            return Ok(Arc::new(EtcdKvStore::new(config)?));
        }

        Err(MsgFilterError::ConfigError(format!(
            "unsupported store endpoint: {}",
            endpoint
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_memory_endpoint() {
        let store = DefaultStoreFactory::default()
            .connect("memory://local")
            .unwrap();
        store.create_if_absent("/k", "v", None).await.unwrap();
        assert_eq!(
            store.get("/k").await.unwrap().record.value.as_deref(),
            Some("v")
        );
    }

    #[test]
    fn test_factory_etcd_endpoint() {
        let factory = DefaultStoreFactory::new(Duration::from_millis(500));
        assert!(factory.connect("http://127.0.0.1:2379").is_ok());
    }

    #[test]
    fn test_factory_rejects_unknown_scheme() {
        let result = DefaultStoreFactory::default().connect("redis://127.0.0.1:6379");
        assert!(matches!(result, Err(MsgFilterError::ConfigError(_))));
    }
}
