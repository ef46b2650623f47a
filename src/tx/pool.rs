//! Pending transactions for the next block

use super::{BroadcastReply, RawTx};
use crate::metrics;

use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct TxPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

#[derive(Default)]
struct PoolInner {
    queue: Vec<RawTx>,
    hashes: HashSet<String>,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity,
        }
    }

    /// Queue a transaction after a structural check; duplicates are accepted once
    pub fn submit(&self, raw_tx: RawTx) -> BroadcastReply {
        let tx_hash = match raw_tx.hash() {
            Ok(hash) => hash,
            Err(e) => return BroadcastReply::rejected(String::new(), e.to_string()),
        };

        if let Err(e) = raw_tx.validate_payload() {
            warn!("Rejected transaction {}: {}", tx_hash, e);
            return BroadcastReply::rejected(tx_hash, e.to_string());
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.hashes.contains(&tx_hash) {
            debug!("Transaction {} already pending", tx_hash);
            return BroadcastReply::accepted(tx_hash);
        }
        if inner.queue.len() >= self.capacity {
            return BroadcastReply::rejected(tx_hash, "transaction pool is full");
        }

        debug!("Queued {:?} transaction {} ({})", raw_tx.tx_type, tx_hash, raw_tx.memo);
        inner.hashes.insert(tx_hash.clone());
        inner.queue.push(raw_tx);
        metrics::set_pool_size(inner.queue.len());
        BroadcastReply::accepted(tx_hash)
    }

    /// Take everything queued, in submission order
    pub fn drain(&self) -> Vec<RawTx> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.hashes.clear();
        metrics::set_pool_size(0);
        std::mem::take(&mut inner.queue)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Address;
    use crate::tx::{ReportFinality, TxType};

    fn report() -> RawTx {
        RawTx::new(
            TxType::BtcReportFinalityMint,
            &ReportFinality::new("tracker_1", Address::new(vec![1]), Address::new(vec![2])),
            "tracker_1#BusyFinalizing",
        )
        .unwrap()
    }

    #[test]
    fn test_submit_dedups_and_drains_in_order() {
        let pool = TxPool::new(10);
        let first = report();
        let second = report();

        assert!(pool.submit(first.clone()).ok);
        assert!(pool.submit(first.clone()).ok);
        assert!(pool.submit(second.clone()).ok);
        assert_eq!(pool.len(), if first == second { 1 } else { 2 });

        let drained = pool.drain();
        assert_eq!(drained[0], first);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_rejects_malformed_and_overflow() {
        let pool = TxPool::new(1);
        let bad = RawTx {
            tx_type: TxType::EthLock,
            data: b"{}".to_vec(),
            memo: String::new(),
            auth: Vec::new(),
        };
        let reply = pool.submit(bad);
        assert!(!reply.ok);
        assert!(reply.error_msg.is_some());

        assert!(pool.submit(report()).ok);
        let mut other = report();
        other.memo = "other".to_string();
        assert!(!pool.submit(other).ok);
    }
}
