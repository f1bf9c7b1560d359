//! msgfilter Store - key-value store clients
//!
//! This crate provides:
//! - The [`KvStore`] contract (get, create-if-absent, delete, watch)
//! - [`EtcdKvStore`], an etcd v2 keys API client
//! - [`MemoryKvStore`], an in-process store with TTLs and watches
//! - [`StoreClientFactory`] for endpoint-driven client creation

pub mod client;
pub mod etcd;
pub mod memory;
pub mod model;

pub use client::{DefaultStoreFactory, KvStore, MEMORY_SCHEME, StoreClientFactory};
pub use etcd::{EtcdConfig, EtcdKvStore};
pub use memory::MemoryKvStore;
pub use model::{KvRead, KvRecord, WatchAction, WatchEvent};
