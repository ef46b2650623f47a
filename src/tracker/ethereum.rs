//! Ethereum lock tracker

use super::{FinalityVotes, Quorum, TrackerRecord};
use crate::keys::{hex_bytes, Address};

use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Lifecycle of an Ethereum lock, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EthTrackerState {
    New,
    BusyBroadcasting,
    BusyFinalizing,
    Finalized,
    Released,
}

impl EthTrackerState {
    pub const ALL: [EthTrackerState; 5] = [
        EthTrackerState::New,
        EthTrackerState::BusyBroadcasting,
        EthTrackerState::BusyFinalizing,
        EthTrackerState::Finalized,
        EthTrackerState::Released,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthTracker {
    /// Hash of the signed lock transaction, `0x`-prefixed
    pub name: String,
    pub state: EthTrackerState,
    pub process_owner: Address,
    #[serde(with = "hex_bytes")]
    pub signed_eth_tx: Vec<u8>,
    pub tx_hash: H256,
    pub lock_amount: U256,
    pub finality_votes: FinalityVotes,
}

impl EthTracker {
    /// Track a user-signed lock transaction; the name is its hash
    pub fn new(owner: Address, signed_eth_tx: Vec<u8>, lock_amount: U256) -> Self {
        let tx_hash = H256::from(keccak256(&signed_eth_tx));
        Self {
            name: format!("{:?}", tx_hash),
            state: EthTrackerState::New,
            process_owner: owner,
            signed_eth_tx,
            tx_hash,
            lock_amount,
            finality_votes: FinalityVotes::new(),
        }
    }

    pub fn check_if_voted(&self, address: &Address) -> Option<usize> {
        self.finality_votes.check_if_voted(address)
    }

    pub fn vote_count(&self) -> usize {
        self.finality_votes.count()
    }

    pub fn add_finality_vote(&mut self, address: Address) -> bool {
        self.finality_votes.add_vote(address)
    }

    /// Enough validators saw the lock confirmed on Ethereum
    pub fn finalized(&self, quorum: Quorum, validators: usize) -> bool {
        self.finality_votes.reached(quorum, validators)
    }
}

impl TrackerRecord for EthTracker {
    type State = EthTrackerState;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EthTrackerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_tx_hash() {
        let raw = vec![0xf8, 0x6b, 0x01];
        let tracker = EthTracker::new(Address::new(vec![1]), raw.clone(), U256::from(10u64));
        assert_eq!(tracker.tx_hash, H256::from(keccak256(&raw)));
        assert!(tracker.name.starts_with("0x"));
        assert_eq!(tracker.name.len(), 66);
        assert_eq!(tracker.state, EthTrackerState::New);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut tracker =
            EthTracker::new(Address::new(vec![1, 2]), vec![0xde, 0xad], U256::from(7u64));
        tracker.add_finality_vote(Address::new(vec![3]));
        let json = serde_json::to_vec(&tracker).unwrap();
        let back: EthTracker = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, tracker);
    }
}
