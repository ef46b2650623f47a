//! Bitcoin lock tracker
//!
//! Bitcoin trackers are long-lived: each one owns a UTXO held by the
//! validators' multisig redeem script. A lock spends that UTXO together with
//! the user's input into a new output, after which the tracker becomes
//! `Available` again with the larger balance.

use super::{FinalityVotes, Quorum, TrackerRecord};
use crate::error::{BridgeError, BridgeResult};
use crate::keys::{hex_bytes, Address, MultiSig, Signature};
use crate::state::{KvStore, PrefixedStore};

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of a Bitcoin lock, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BtcTrackerState {
    Available,
    Requested,
    BusyBroadcasting,
    BusyFinalizing,
    Finalized,
}

impl BtcTrackerState {
    pub const ALL: [BtcTrackerState; 5] = [
        BtcTrackerState::Available,
        BtcTrackerState::Requested,
        BtcTrackerState::BusyBroadcasting,
        BtcTrackerState::BusyFinalizing,
        BtcTrackerState::Finalized,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcTracker {
    pub name: String,
    pub state: BtcTrackerState,

    /// Outpoint `(current_tx_id, 0)` holds the tracker balance
    pub current_tx_id: Option<Txid>,
    pub current_balance: u64,
    pub current_lock_script_address: String,

    pub process_owner: Option<Address>,
    #[serde(with = "hex_bytes")]
    pub process_unsigned_tx: Vec<u8>,
    pub process_tx_id: Option<Txid>,
    pub process_lock_amount: u64,
    pub process_lock_script_address: String,

    pub finality_votes: FinalityVotes,
    pub multisig: Option<MultiSig>,
}

impl BtcTracker {
    pub fn new(name: impl Into<String>, lock_script_address: impl Into<String>) -> Self {
        let lock_script_address = lock_script_address.into();
        Self {
            name: name.into(),
            state: BtcTrackerState::Available,
            current_tx_id: None,
            current_balance: 0,
            current_lock_script_address: lock_script_address.clone(),
            process_owner: None,
            process_unsigned_tx: Vec::new(),
            process_tx_id: None,
            process_lock_amount: 0,
            process_lock_script_address: lock_script_address,
            finality_votes: FinalityVotes::new(),
            multisig: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == BtcTrackerState::Available
    }

    pub fn is_busy(&self) -> bool {
        !self.is_available()
    }

    /// Accept a user lock and start collecting validator signatures
    pub fn begin_lock(
        &mut self,
        owner: Address,
        unsigned_tx: Vec<u8>,
        lock_amount: u64,
        multisig: MultiSig,
    ) -> BridgeResult<()> {
        if !self.is_available() {
            return Err(BridgeError::invalid_transition("LOCK", self.state));
        }
        if lock_amount == 0 {
            return Err(BridgeError::Validation("lock amount must be positive".to_string()));
        }

        self.process_owner = Some(owner);
        self.process_unsigned_tx = unsigned_tx;
        self.process_lock_amount = lock_amount;
        self.process_tx_id = None;
        self.finality_votes.clear();
        self.multisig = Some(multisig);
        self.state = BtcTrackerState::Requested;
        Ok(())
    }

    /// Add a validator signature to the pending spend
    pub fn add_signature(&mut self, signature: Signature) -> BridgeResult<()> {
        if self.state != BtcTrackerState::Requested {
            return Err(BridgeError::invalid_transition("ADD_SIGNATURE", self.state));
        }
        let multisig = self
            .multisig
            .as_mut()
            .ok_or_else(|| BridgeError::Validation(format!("tracker {} has no multisig", self.name)))?;
        multisig.add_signature(signature)
    }

    pub fn has_voted_finality(&self, address: &Address) -> bool {
        self.finality_votes.has_voted(address)
    }

    pub fn vote_count(&self) -> usize {
        self.finality_votes.count()
    }

    pub fn add_finality_vote(&mut self, address: Address) -> bool {
        self.finality_votes.add_vote(address)
    }

    pub fn finalized(&self, quorum: Quorum, validators: usize) -> bool {
        self.finality_votes.reached(quorum, validators)
    }

    /// Fold the finished lock into the tracker balance and clear process fields
    pub fn settle(&mut self) {
        self.current_tx_id = self.process_tx_id.take();
        self.current_balance += self.process_lock_amount;
        self.current_lock_script_address = self.process_lock_script_address.clone();

        self.process_owner = None;
        self.process_unsigned_tx.clear();
        self.process_lock_amount = 0;
        self.finality_votes.clear();
        self.multisig = None;
        self.state = BtcTrackerState::Available;
    }
}

impl TrackerRecord for BtcTracker {
    type State = BtcTrackerState;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> BtcTrackerState {
        self.state
    }
}

impl super::TrackerStore<BtcTracker> {
    /// First tracker free to accept a new lock
    pub fn tracker_for_lock(&self) -> BridgeResult<BtcTracker> {
        self.list()?
            .into_iter()
            .find(|t| t.is_available())
            .ok_or_else(|| BridgeError::TrackerNotFound {
                name: "<available>".to_string(),
            })
    }
}

/// Redeem scripts keyed by their P2SH script-hash address
pub struct LockScriptStore {
    store: PrefixedStore,
}

impl LockScriptStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            store: PrefixedStore::new(backend, "lockscript/"),
        }
    }

    pub fn save_lock_script(&self, address: &str, script: &[u8]) -> BridgeResult<()> {
        self.store.set(address, script)
    }

    pub fn get_lock_script(&self, address: &str) -> BridgeResult<Vec<u8>> {
        self.store
            .get(address)?
            .ok_or_else(|| BridgeError::LockScriptNotFound {
                address: address.to_string(),
            })
    }
}
