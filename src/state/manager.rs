//! Typed stores shared by the coordinator, jobs and API

use super::{KvStore, MemoryStore, SledStore};
use crate::chain::bitcoin::lock_script_address;
use crate::error::BridgeResult;
use crate::jobs::JobStore;
use crate::tracker::{BtcTracker, EthTracker, LockScriptStore, TrackerStore};

use ::bitcoin::Script;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const CONSENSUS_TREE: &str = "consensus";
const LOCAL_TREE: &str = "local";

/// Trackers and lock scripts are consensus state; jobs are local to this node
pub struct StateManager {
    pub btc_trackers: TrackerStore<BtcTracker>,
    pub eth_trackers: TrackerStore<EthTracker>,
    pub lock_scripts: LockScriptStore,
    pub jobs: JobStore,
    db: Option<sled::Db>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub btc_trackers: usize,
    pub btc_trackers_busy: usize,
    pub eth_trackers: usize,
    pub pending_jobs: usize,
}

impl StateManager {
    pub fn in_memory() -> Self {
        Self::from_backends(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()), None)
    }

    /// Open the sled database under `path`
    pub fn open(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let db = sled::open(path.as_ref())?;
        let consensus = SledStore::from_tree(db.open_tree(CONSENSUS_TREE)?);
        let local = SledStore::from_tree(db.open_tree(LOCAL_TREE)?);
        info!("Opened bridge state at {:?}", path.as_ref());

        Ok(Self::from_backends(Arc::new(consensus), Arc::new(local), Some(db)))
    }

    fn from_backends(consensus: Arc<dyn KvStore>, local: Arc<dyn KvStore>, db: Option<sled::Db>) -> Self {
        Self {
            btc_trackers: TrackerStore::new(consensus.clone(), "tracker/btc/"),
            eth_trackers: TrackerStore::new(consensus.clone(), "tracker/eth/"),
            lock_scripts: LockScriptStore::new(consensus),
            jobs: JobStore::new(local),
            db,
        }
    }

    pub fn flush(&self) -> BridgeResult<()> {
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    /// Register the validators' redeem script and create missing Bitcoin trackers.
    /// Returns how many trackers were created.
    pub fn seed_btc_trackers(&self, names: &[String], redeem_script: &[u8]) -> BridgeResult<usize> {
        let address = lock_script_address(Script::from_bytes(redeem_script));
        self.lock_scripts.save_lock_script(&address, redeem_script)?;

        let mut created = 0;
        for name in names {
            if self.btc_trackers.exists(name)? {
                continue;
            }
            self.btc_trackers
                .create(&BtcTracker::new(name.clone(), address.clone()))?;
            created += 1;
        }
        info!(
            "Seeded {} bitcoin trackers on lock script {}",
            created, address
        );
        Ok(created)
    }

    pub fn get_stats(&self) -> BridgeResult<StoreStats> {
        let btc = self.btc_trackers.list()?;
        Ok(StoreStats {
            btc_trackers: btc.len(),
            btc_trackers_busy: btc.iter().filter(|t| t.is_busy()).count(),
            eth_trackers: self.eth_trackers.list()?.len(),
            pending_jobs: self.jobs.pending_jobs()?.len(),
        })
    }
}
