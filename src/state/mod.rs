//! Key-value persistence for trackers, jobs and lock scripts
//!
//! Handles:
//! - The narrow get/set/delete/exists contract every bridge store is built on
//! - Prefix namespacing so several stores share one backend
//! - In-memory (tests, ephemeral nodes) and sled-backed durable storage

mod manager;
mod memory;
mod sled_store;

pub use manager::{StateManager, StoreStats};
pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::BridgeResult;

use std::sync::Arc;

/// Minimal key-value contract of the host state store
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> BridgeResult<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]) -> BridgeResult<()>;

    /// Returns true if the key existed
    fn delete(&self, key: &[u8]) -> BridgeResult<bool>;

    fn exists(&self, key: &[u8]) -> BridgeResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries under `prefix`, sorted by key
    fn scan_prefix(&self, prefix: &[u8]) -> BridgeResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// A view of a store restricted to one key prefix
#[derive(Clone)]
pub struct PrefixedStore {
    inner: Arc<dyn KvStore>,
    prefix: Vec<u8>,
}

impl PrefixedStore {
    pub fn new(inner: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.as_bytes().to_vec(),
        }
    }

    fn key(&self, key: &str) -> Vec<u8> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key.as_bytes());
        full
    }

    pub fn get(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        self.inner.get(&self.key(key))
    }

    pub fn set(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.inner.set(&self.key(key), value)
    }

    pub fn delete(&self, key: &str) -> BridgeResult<bool> {
        self.inner.delete(&self.key(key))
    }

    pub fn exists(&self, key: &str) -> BridgeResult<bool> {
        self.inner.exists(&self.key(key))
    }

    /// Values whose key (without this store's prefix) starts with `sub_prefix`
    pub fn values(&self, sub_prefix: &str) -> BridgeResult<Vec<Vec<u8>>> {
        Ok(self
            .inner
            .scan_prefix(&self.key(sub_prefix))?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }
}
