//! Block processing for both chains

use super::bitcoin::{btc_lock_engine, BtcTrackerCtx};
use super::engine::{Engine, Outcome, TransitionContext};
use super::ethereum::{eth_lock_engine, EthTrackerCtx};
use super::{BridgeEnv, EngineInfo};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::state::StateManager;
use crate::tracker::LedgerEffect;
use crate::tx::{apply_tx, RawTx, TxContext, TxPool};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// What one block did
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockSummary {
    pub height: u64,
    pub txs_applied: usize,
    pub txs_duplicate: usize,
    pub txs_rejected: usize,
    pub advanced: usize,
    pub deleted: usize,
    pub failed: usize,
    pub effects: Vec<LedgerEffect>,
}

/// Drives every tracker through its chain's engine once per block
pub struct Coordinator {
    state: Arc<StateManager>,
    env: Arc<BridgeEnv>,
    btc_engine: Engine<BtcTrackerCtx>,
    eth_engine: Engine<EthTrackerCtx>,
    height: AtomicU64,
    last_block: Mutex<Option<BlockSummary>>,
}

impl Coordinator {
    pub fn new(state: Arc<StateManager>, env: BridgeEnv) -> BridgeResult<Self> {
        Ok(Self {
            state,
            env: Arc::new(env),
            btc_engine: btc_lock_engine()?,
            eth_engine: eth_lock_engine()?,
            height: AtomicU64::new(0),
            last_block: Mutex::new(None),
        })
    }

    pub fn env(&self) -> &BridgeEnv {
        &self.env
    }

    pub fn engines(&self) -> Vec<EngineInfo> {
        vec![
            EngineInfo::describe("bitcoin", &self.btc_engine),
            EngineInfo::describe("ethereum", &self.eth_engine),
        ]
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn last_block(&self) -> Option<BlockSummary> {
        self.last_block
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Standalone block producer: drains the pool into a block every interval
    pub async fn run(
        &self,
        pool: Arc<TxPool>,
        block_interval_ms: u64,
        shutdown: Arc<RwLock<bool>>,
    ) -> BridgeResult<()> {
        let mut ticker = interval(Duration::from_millis(block_interval_ms));
        info!("Coordinator started at height {}", self.height());

        loop {
            if *shutdown.read().await {
                break;
            }

            ticker.tick().await;
            let height = self.height() + 1;
            let txs = pool.drain();
            if let Err(e) = self.process_block(height, &txs) {
                error!("Error processing block {}: {}", height, e);
            }
        }

        info!("Coordinator stopped");
        Ok(())
    }

    /// Apply `txs`, then advance every tracker at most one step
    pub fn process_block(&self, height: u64, txs: &[RawTx]) -> BridgeResult<BlockSummary> {
        let mut summary = BlockSummary {
            height,
            ..Default::default()
        };

        let tx_ctx = TxContext {
            state: &self.state,
            validators: &self.env.validators,
            quorum: self.env.quorum,
        };
        for raw_tx in txs {
            match apply_tx(&tx_ctx, raw_tx) {
                Ok(true) => summary.txs_applied += 1,
                Ok(false) => summary.txs_duplicate += 1,
                Err(e) => {
                    warn!("Rejected {:?} transaction in block {}: {}", raw_tx.tx_type, height, e);
                    summary.txs_rejected += 1;
                }
            }
        }

        for tracker in self.state.btc_trackers.list()? {
            let mut ctx = BtcTrackerCtx::new(tracker, self.env.clone(), self.state.clone());
            let outcome = self.btc_engine.process(&mut ctx);
            if self.settle(outcome, &ctx, &mut summary) {
                self.state.btc_trackers.set(&ctx.tracker)?;
            }
            summary.effects.append(&mut ctx.effects);
        }

        for tracker in self.state.eth_trackers.list()? {
            let mut ctx = EthTrackerCtx::new(tracker, self.env.clone(), self.state.clone());
            let outcome = self.eth_engine.process(&mut ctx);
            if self.settle(outcome, &ctx, &mut summary) {
                self.state.eth_trackers.set(&ctx.tracker)?;
            }
            summary.effects.append(&mut ctx.effects);
        }

        self.state.flush()?;
        self.height.store(height, Ordering::SeqCst);
        metrics::record_block(&summary);

        if summary.txs_applied > 0 || summary.advanced > 0 || summary.deleted > 0 {
            info!(
                "Block {}: {} txs applied, {} rejected, {} trackers advanced, {} deleted",
                height, summary.txs_applied, summary.txs_rejected, summary.advanced, summary.deleted
            );
        }
        for effect in &summary.effects {
            info!("Ledger effect in block {}: {:?}", height, effect);
        }

        *self.last_block.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary.clone());
        Ok(summary)
    }

    /// Tally one engine outcome; returns whether the tracker must be written back
    fn settle<C: TransitionContext>(
        &self,
        outcome: BridgeResult<Outcome<C::State>>,
        ctx: &C,
        summary: &mut BlockSummary,
    ) -> bool {
        match outcome {
            Ok(Outcome::Advanced(_)) => {
                summary.advanced += 1;
                true
            }
            Ok(Outcome::Deleted) => {
                summary.deleted += 1;
                false
            }
            Ok(Outcome::Unchanged) => false,
            Err(e) if e.is_invalid_transition() => {
                debug!("Skipped tracker in {:?}: {}", ctx.current_state(), e);
                false
            }
            Err(BridgeError::UnknownState(state)) => {
                error!("Tracker in undeclared state {}", state);
                summary.failed += 1;
                false
            }
            Err(e) => {
                warn!("Transition from {:?} failed: {}", ctx.current_state(), e);
                summary.failed += 1;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{EthFinality, MockBtcChainDriver, MockEthChainDriver};
    use crate::config::JobsConfig;
    use crate::jobs::{JobScheduler, JobsContext};
    use crate::keys::{Address, NodeKey, ValidatorSet};
    use crate::chain::bitcoin::{encode_tx, multisig_redeem_script, prepare_tracker_lock};
    use crate::keys::{MultiSig, Signature};
    use crate::tracker::{BtcTrackerState, Currency, EthTrackerState, Quorum};
    use crate::tx::{AddSignature, BtcLock, EthLock, LoopbackBroadcaster, ReportFinality, TxType};
    use ::bitcoin::hashes::Hash;
    use ::bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
    use ::bitcoin::{OutPoint, PublicKey, ScriptBuf, Transaction, Txid};
    use ethers::types::{H256, U256};

    fn jobs_config() -> JobsConfig {
        JobsConfig {
            finality_initial_delay_secs: 0,
            finality_recheck_secs: 0,
            ..Default::default()
        }
    }

    fn key(i: u8) -> NodeKey {
        NodeKey::from_secret_bytes(&[i; 32]).unwrap()
    }

    fn env(validators: u8) -> BridgeEnv {
        BridgeEnv {
            node_address: key(1).address().clone(),
            validators: ValidatorSet::new((1..=validators).map(|i| key(i).address().clone()).collect()),
            quorum: Quorum::TwoThirds,
            jobs: jobs_config(),
        }
    }

    fn eth_lock() -> RawTx {
        let lock = EthLock {
            locker: Address::new(vec![9]),
            eth_tx: vec![0xf8, 0x6b, 0x01],
            lock_amount: U256::from(5_000u64),
        };
        RawTx::new(TxType::EthLock, &lock, "").unwrap()
    }

    #[test]
    fn test_engines_are_inspectable() {
        let coordinator = Coordinator::new(Arc::new(StateManager::in_memory()), env(1)).unwrap();
        let engines = coordinator.engines();
        assert_eq!(engines.len(), 2);
        assert_eq!(engines[0].transitions.len(), 4);
        assert_eq!(engines[1].transitions.len(), 5);
        assert_eq!(engines[1].transitions[4].to, "Deleted");
    }

    #[test]
    fn test_rejected_tx_does_not_stop_block() {
        let state = Arc::new(StateManager::in_memory());
        let coordinator = Coordinator::new(state.clone(), env(3)).unwrap();

        let stray_vote = RawTx::new(
            TxType::EthReportFinalityMint,
            &ReportFinality::new("0xdead", Address::new(vec![9]), key(2).address().clone()),
            "",
        )
        .unwrap()
        .signed(&key(2));

        let summary = coordinator.process_block(1, &[stray_vote, eth_lock()]).unwrap();
        assert_eq!(summary.txs_rejected, 1);
        assert_eq!(summary.txs_applied, 1);
        assert_eq!(summary.advanced, 1);
        assert_eq!(coordinator.height(), 1);

        let tracker = state.eth_trackers.list().unwrap().remove(0);
        assert_eq!(tracker.state, EthTrackerState::BusyBroadcasting);
        assert_eq!(state.jobs.list().unwrap().len(), 1);
    }

    #[test]
    fn test_votes_below_quorum_hold_the_tracker() {
        let state = Arc::new(StateManager::in_memory());
        let coordinator = Coordinator::new(state.clone(), env(4)).unwrap();
        coordinator.process_block(1, &[eth_lock()]).unwrap();
        let name = state.eth_trackers.list().unwrap().remove(0).name;

        let vote = |v: u8| {
            RawTx::new(
                TxType::EthReportFinalityMint,
                &ReportFinality::new(name.clone(), Address::new(vec![9]), key(v).address().clone()),
                "",
            )
            .unwrap()
            .signed(&key(v))
        };

        coordinator.process_block(2, &[vote(2)]).unwrap();
        coordinator.process_block(3, &[vote(3)]).unwrap();
        let summary = coordinator.process_block(4, &[]).unwrap();
        assert_eq!(summary.advanced, 0);
        assert_eq!(
            state.eth_trackers.get(&name).unwrap().state,
            EthTrackerState::BusyFinalizing
        );

        coordinator.process_block(5, &[vote(4)]).unwrap();
        assert_eq!(
            state.eth_trackers.get(&name).unwrap().state,
            EthTrackerState::Finalized
        );
    }

    #[test]
    fn test_votes_under_other_validators_names_are_rejected() {
        let state = Arc::new(StateManager::in_memory());
        let coordinator = Coordinator::new(state.clone(), env(4)).unwrap();
        coordinator.process_block(1, &[eth_lock()]).unwrap();
        let name = state.eth_trackers.list().unwrap().remove(0).name;

        // this node signs votes claiming every other validator
        let forged: Vec<_> = (2..=4)
            .map(|v| {
                RawTx::new(
                    TxType::EthReportFinalityMint,
                    &ReportFinality::new(name.clone(), Address::new(vec![9]), key(v).address().clone()),
                    "",
                )
                .unwrap()
                .signed(&key(1))
            })
            .collect();

        let summary = coordinator.process_block(2, &forged).unwrap();
        assert_eq!(summary.txs_rejected, 3);
        let tracker = state.eth_trackers.get(&name).unwrap();
        assert_eq!(tracker.vote_count(), 0);
        assert_eq!(tracker.state, EthTrackerState::BusyBroadcasting);

        coordinator.process_block(3, &[]).unwrap();
        assert!(coordinator.last_block().unwrap().effects.is_empty());
        assert_eq!(
            state.eth_trackers.get(&name).unwrap().state,
            EthTrackerState::BusyBroadcasting
        );
    }

    #[tokio::test]
    async fn test_eth_lock_end_to_end() {
        let mut eth = MockEthChainDriver::new();
        eth.expect_broadcast_raw()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x11)));
        eth.expect_check_finality()
            .returning(|_| Ok(EthFinality::Confirmed));

        let state = Arc::new(StateManager::in_memory());
        let pool = Arc::new(TxPool::new(64));
        let coordinator = Coordinator::new(state.clone(), env(1)).unwrap();
        let jobs = Arc::new(JobsContext {
            state: state.clone(),
            btc: Some(Arc::new(MockBtcChainDriver::new())),
            eth: Some(Arc::new(eth)),
            broadcaster: Arc::new(LoopbackBroadcaster::new(pool.clone())),
            node_key: key(1),
            config: jobs_config(),
        });
        let scheduler = JobScheduler::new(jobs, Arc::new(RwLock::new(false)));

        pool.submit(eth_lock());
        coordinator.process_block(1, &pool.drain()).unwrap();
        scheduler.run_once().await.unwrap();

        // broadcast done: finality job scheduled, no vote yet
        coordinator.process_block(2, &pool.drain()).unwrap();
        scheduler.run_once().await.unwrap();
        assert_eq!(pool.len(), 1);

        let mut effects = Vec::new();
        let mut deleted = 0;
        for height in 3..=6 {
            let summary = coordinator.process_block(height, &pool.drain()).unwrap();
            effects.extend(summary.effects);
            deleted += summary.deleted;
        }

        assert_eq!(deleted, 1);
        assert_eq!(effects.len(), 1);
        let LedgerEffect::Mint {
            owner,
            currency,
            amount,
            ..
        } = &effects[0];
        assert_eq!(owner, &Address::new(vec![9]));
        assert_eq!(*currency, Currency::Eth);
        assert_eq!(*amount, U256::from(5_000u64));

        assert!(state.eth_trackers.list().unwrap().is_empty());
        assert!(state.jobs.list().unwrap().is_empty());
        assert_eq!(coordinator.last_block().unwrap().height, 6);
    }

    fn btc_lock(tx: &Transaction, lock_amount: u64) -> RawTx {
        let lock = BtcLock {
            locker: Address::new(vec![9]),
            tracker_name: "tracker_1".to_string(),
            btc_tx: encode_tx(tx),
            lock_amount,
        };
        RawTx::new(TxType::BtcLock, &lock, "").unwrap()
    }

    /// Validator 1's DER signature over the pending spend, as an AddSignature tx
    fn add_signature(multisig: &MultiSig) -> RawTx {
        let signer = key(1);
        let digest = <[u8; 32]>::try_from(multisig.message()).unwrap();
        let secret = SecretKey::from_slice(&[1; 32]).unwrap();
        let mut sign = Secp256k1::new()
            .sign_ecdsa(&Message::from_digest(digest), &secret)
            .serialize_der()
            .to_vec();
        // SIGHASH_ALL
        sign.push(0x01);

        let add = AddSignature {
            tracker_name: "tracker_1".to_string(),
            message: multisig.message().to_vec(),
            signature: Signature {
                index: multisig.signer_index(signer.address()).unwrap(),
                address: signer.address().clone(),
                sign,
            },
        };
        RawTx::new(TxType::BtcAddSignature, &add, "").unwrap().signed(&signer)
    }

    /// Lock, sign, broadcast, vote and release one Bitcoin lock on tracker_1
    async fn drive_btc_lock(
        state: &StateManager,
        coordinator: &Coordinator,
        scheduler: &JobScheduler,
        pool: &TxPool,
        first_height: u64,
        lock: RawTx,
    ) -> Vec<LedgerEffect> {
        pool.submit(lock);
        coordinator.process_block(first_height, &pool.drain()).unwrap();
        let tracker = state.btc_trackers.get("tracker_1").unwrap();
        assert_eq!(tracker.state, BtcTrackerState::Requested);

        // the spend waits for its signatures
        pool.submit(add_signature(tracker.multisig.as_ref().unwrap()));
        coordinator.process_block(first_height + 1, &pool.drain()).unwrap();
        assert_eq!(
            state.btc_trackers.get("tracker_1").unwrap().state,
            BtcTrackerState::BusyBroadcasting
        );

        // broadcast, then the finality vote lands in the pool
        scheduler.run_once().await.unwrap();
        scheduler.run_once().await.unwrap();
        assert_eq!(pool.len(), 1);

        let mut effects = Vec::new();
        for height in first_height + 2..=first_height + 4 {
            let summary = coordinator.process_block(height, &pool.drain()).unwrap();
            assert_eq!(summary.txs_rejected, 0);
            effects.extend(summary.effects);
        }
        effects
    }

    #[tokio::test]
    async fn test_btc_lock_end_to_end() {
        let broadcasts = Arc::new(Mutex::new(Vec::<Transaction>::new()));
        let seen = broadcasts.clone();
        let mut btc = MockBtcChainDriver::new();
        btc.expect_broadcast_tx().times(2).returning(move |tx| {
            seen.lock().unwrap().push(tx.clone());
            Ok(tx.compute_txid())
        });
        btc.expect_check_finality().returning(|_| Ok(true));

        let state = Arc::new(StateManager::in_memory());
        let secp = Secp256k1::new();
        let validator = PublicKey::new(SecretKey::from_slice(&[1; 32]).unwrap().public_key(&secp));
        let script: ScriptBuf = multisig_redeem_script(1, &[validator]).unwrap();
        state
            .seed_btc_trackers(&["tracker_1".to_string()], script.as_bytes())
            .unwrap();

        let pool = Arc::new(TxPool::new(64));
        let coordinator = Coordinator::new(state.clone(), env(1)).unwrap();
        let jobs = Arc::new(JobsContext {
            state: state.clone(),
            btc: Some(Arc::new(btc)),
            eth: Some(Arc::new(MockEthChainDriver::new())),
            broadcaster: Arc::new(LoopbackBroadcaster::new(pool.clone())),
            node_key: key(1),
            config: jobs_config(),
        });
        let scheduler = JobScheduler::new(jobs, Arc::new(RwLock::new(false)));

        // first lock: the tracker has no UTXO yet
        let user = OutPoint {
            txid: Txid::from_byte_array([5; 32]),
            vout: 0,
        };
        let tracker = state.btc_trackers.get("tracker_1").unwrap();
        let first = prepare_tracker_lock(&tracker, script.as_bytes(), user, 10_000, 500).unwrap();
        let effects = drive_btc_lock(&state, &coordinator, &scheduler, &pool, 1, btc_lock(&first, 9_500)).await;

        assert_eq!(effects.len(), 1);
        let LedgerEffect::Mint {
            tracker: name,
            owner,
            currency,
            amount,
        } = &effects[0];
        assert_eq!(name, "tracker_1");
        assert_eq!(owner, &Address::new(vec![9]));
        assert_eq!(*currency, Currency::Btc);
        assert_eq!(*amount, U256::from(9_500u64));

        let tracker = state.btc_trackers.get("tracker_1").unwrap();
        assert_eq!(tracker.state, BtcTrackerState::Available);
        assert_eq!(tracker.current_tx_id, Some(first.compute_txid()));
        assert_eq!(tracker.current_balance, 9_500);
        assert!(state.jobs.list().unwrap().is_empty());

        // second lock spends the tracker UTXO under the validators' script
        let user = OutPoint {
            txid: Txid::from_byte_array([6; 32]),
            vout: 1,
        };
        let second = prepare_tracker_lock(&tracker, script.as_bytes(), user, 4_000, 300).unwrap();
        let effects = drive_btc_lock(&state, &coordinator, &scheduler, &pool, 6, btc_lock(&second, 3_700)).await;

        assert_eq!(effects.len(), 1);
        let LedgerEffect::Mint { amount, .. } = &effects[0];
        assert_eq!(*amount, U256::from(3_700u64));

        let broadcasts = broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcasts[0], first);
        let spend = &broadcasts[1];
        assert_eq!(spend.input[0].previous_output.txid, first.compute_txid());
        assert!(spend.input[0].script_sig.as_bytes().ends_with(script.as_bytes()));
        assert!(spend.input[1].script_sig.is_empty());

        let tracker = state.btc_trackers.get("tracker_1").unwrap();
        assert_eq!(tracker.state, BtcTrackerState::Available);
        assert_eq!(tracker.current_tx_id, Some(spend.compute_txid()));
        assert_eq!(tracker.current_balance, 13_200);
        assert!(tracker.multisig.is_none());
        assert!(state.jobs.list().unwrap().is_empty());
        assert_eq!(coordinator.last_block().unwrap().height, 10);
    }
}
