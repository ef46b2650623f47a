//! In-memory store

use super::KvStore;
use crate::error::BridgeResult;

use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> BridgeResult<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> BridgeResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn exists(&self, key: &[u8]) -> BridgeResult<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> BridgeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut result: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }
}
