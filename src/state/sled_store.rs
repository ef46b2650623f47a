//! Durable store on an embedded sled tree

use super::KvStore;
use crate::error::BridgeResult;

use std::path::Path;
use tracing::info;

/// One sled tree; nodes open separate trees for consensus state and local jobs
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) `tree` inside the database at `path`
    pub fn open(path: impl AsRef<Path>, tree: &str) -> BridgeResult<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(tree)?;
        info!("Opened sled tree {:?} at {:?}", tree.name(), path.as_ref());
        Ok(Self { tree })
    }

    pub fn from_tree(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn flush(&self) -> BridgeResult<()> {
        self.tree.flush()?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> BridgeResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> BridgeResult<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    fn exists(&self, key: &[u8]) -> BridgeResult<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> BridgeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut result = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (k, v) = entry?;
            result.push((k.to_vec(), v.to_vec()));
        }
        Ok(result)
    }
}
